use super::{AXES, Point};

/// One of the six faces of a box.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Face {
    MinZ,
    MaxZ,
    MinY,
    MaxY,
    MinX,
    MaxX,
}

impl Face {
    pub const ALL: [Face; 6] = [
        Face::MinZ,
        Face::MaxZ,
        Face::MinY,
        Face::MaxY,
        Face::MinX,
        Face::MaxX,
    ];

    /// Faces pointing toward increasing coordinates. Visiting only these
    /// reaches every neighboring pair exactly once.
    pub const UPPER: [Face; 3] = [Face::MaxZ, Face::MaxY, Face::MaxX];

    pub const fn axis(self) -> usize {
        match self {
            Face::MinZ | Face::MaxZ => 0,
            Face::MinY | Face::MaxY => 1,
            Face::MinX | Face::MaxX => 2,
        }
    }

    pub const fn is_upper(self) -> bool {
        matches!(self, Face::MaxZ | Face::MaxY | Face::MaxX)
    }

    pub const fn opposite(self) -> Face {
        match self {
            Face::MinZ => Face::MaxZ,
            Face::MaxZ => Face::MinZ,
            Face::MinY => Face::MaxY,
            Face::MaxY => Face::MinY,
            Face::MinX => Face::MaxX,
            Face::MaxX => Face::MinX,
        }
    }

    /// Unit step across this face.
    pub const fn step(self) -> i64 {
        if self.is_upper() { 1 } else { -1 }
    }

    /// Moves `p` one voxel across this face.
    pub fn cross(self, p: Point) -> Point {
        let mut q = p;
        q[self.axis()] += self.step();
        q
    }

    pub(crate) const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// Compact set of faces.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FaceSet(u8);

impl FaceSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, face: Face) {
        self.0 |= face.bit();
    }

    pub const fn contains(self, face: Face) -> bool {
        self.0 & face.bit() != 0
    }

    pub fn iter(self) -> impl Iterator<Item = Face> {
        Face::ALL.into_iter().filter(move |f| self.contains(*f))
    }

    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

const _: () = assert!(AXES == 3);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opposite_is_an_involution() {
        for face in Face::ALL {
            assert_eq!(face.opposite().opposite(), face);
            assert_eq!(face.opposite().axis(), face.axis());
            assert_ne!(face.opposite().is_upper(), face.is_upper());
        }
    }

    #[test]
    fn face_set_membership() {
        let mut set = FaceSet::empty();
        set.insert(Face::MaxY);
        set.insert(Face::MinZ);
        assert!(set.contains(Face::MaxY));
        assert!(!set.contains(Face::MinY));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![Face::MinZ, Face::MaxY]);
        assert_eq!(set.len(), 2);
    }
}
