//! Two co-located values stored inline.
//!
//! `Pair` is the building block for queue slots: the first half is the
//! publication flag and the second half the payload. Being `#[repr(C)]` the
//! layout is identical in every process that maps the region.

use std::ptr::{self, addr_of_mut};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Pair<A, B> {
    pub first: A,
    pub second: B,
}

impl<A, B> Pair<A, B> {
    pub const fn new(first: A, second: B) -> Self {
        Self { first, second }
    }

    #[inline]
    pub fn first(&self) -> &A {
        &self.first
    }

    #[inline]
    pub fn second(&self) -> &B {
        &self.second
    }

    #[inline]
    pub fn first_mut(&mut self) -> &mut A {
        &mut self.first
    }

    #[inline]
    pub fn second_mut(&mut self) -> &mut B {
        &mut self.second
    }

    /// Alias of [`first`](Self::first) for map-like use.
    #[inline]
    pub fn key(&self) -> &A {
        &self.first
    }

    /// Alias of [`second`](Self::second) for map-like use.
    #[inline]
    pub fn val(&self) -> &B {
        &self.second
    }

    #[inline]
    pub fn val_mut(&mut self) -> &mut B {
        &mut self.second
    }

    pub fn into_parts(self) -> (A, B) {
        (self.first, self.second)
    }

    /// Build each half directly at its final address.
    ///
    /// `make_first` and `make_second` receive a pointer to uninitialized
    /// storage for their half and must fully initialize it.
    ///
    /// # Safety
    /// `dst` must be valid for writes and suitably aligned for `Pair<A, B>`.
    /// Any previous contents are overwritten without being dropped.
    pub unsafe fn emplace_piecewise<FA, FB>(dst: *mut Self, make_first: FA, make_second: FB)
    where
        FA: FnOnce(*mut A),
        FB: FnOnce(*mut B),
    {
        // SAFETY: dst is valid per the caller; addr_of_mut! avoids creating
        // references to uninitialized fields.
        unsafe {
            make_first(addr_of_mut!((*dst).first));
            make_second(addr_of_mut!((*dst).second));
        }
    }

    /// Move `first` and `second` into place at `dst`.
    ///
    /// # Safety
    /// Same requirements as [`emplace_piecewise`](Self::emplace_piecewise).
    pub unsafe fn emplace(dst: *mut Self, first: A, second: B) {
        // SAFETY: forwarded from the caller.
        unsafe { Self::emplace_piecewise(dst, |p| p.write(first), |p| p.write(second)) }
    }

    /// Drop both halves in place. A pair has no null state, so both are
    /// always torn down.
    ///
    /// # Safety
    /// `p` must point to an initialized pair that is not used afterwards.
    pub unsafe fn destroy_in_place(p: *mut Self) {
        // SAFETY: forwarded from the caller.
        unsafe {
            ptr::drop_in_place(addr_of_mut!((*p).first));
            ptr::drop_in_place(addr_of_mut!((*p).second));
        }
    }
}

impl<A, B> From<(A, B)> for Pair<A, B> {
    fn from((first, second): (A, B)) -> Self {
        Self { first, second }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::mem::MaybeUninit;
    use std::rc::Rc;

    #[test]
    fn accessors_alias_the_same_storage() {
        let mut p = Pair::new(3u32, String::from("three"));
        assert_eq!(p.key(), p.first());
        assert_eq!(p.val(), "three");
        p.val_mut().push('!');
        *p.first_mut() += 1;
        assert_eq!(p.into_parts(), (4, String::from("three!")));
    }

    #[test]
    fn default_and_from_tuple() {
        let d: Pair<u8, u64> = Pair::default();
        assert_eq!(d, Pair::new(0, 0));
        assert_eq!(Pair::from((1, 2)), Pair::new(1, 2));
    }

    #[test]
    fn piecewise_construction_builds_each_half_in_place() {
        let mut slot = MaybeUninit::<Pair<u64, [u8; 4]>>::uninit();
        let dst = slot.as_mut_ptr();
        unsafe {
            Pair::emplace_piecewise(
                dst,
                |a| a.write(7),
                |b| {
                    for i in 0..4 {
                        (b as *mut u8).add(i).write(i as u8 * 2);
                    }
                },
            );
        }
        let p = unsafe { slot.assume_init() };
        assert_eq!(p.first, 7);
        assert_eq!(p.second, [0, 2, 4, 6]);
    }

    struct DropCount(Rc<Cell<u32>>);

    impl Drop for DropCount {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn destroy_in_place_drops_both_halves() {
        let drops = Rc::new(Cell::new(0));
        let mut slot = MaybeUninit::<Pair<DropCount, DropCount>>::uninit();
        unsafe {
            Pair::emplace(
                slot.as_mut_ptr(),
                DropCount(drops.clone()),
                DropCount(drops.clone()),
            );
            Pair::destroy_in_place(slot.as_mut_ptr());
        }
        assert_eq!(drops.get(), 2);
    }
}
