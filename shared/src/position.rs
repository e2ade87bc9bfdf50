use serde::{Deserialize, Serialize};

/// Distance in tiles within which entities see each other.
pub const VIEW_DISTANCE: i32 = 15;

/// A tile coordinate on one of the four planes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Position {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// 8x8 chunk holding this tile.
    pub fn chunk_x(&self) -> i32 {
        self.x >> 3
    }

    pub fn chunk_y(&self) -> i32 {
        self.y >> 3
    }

    /// Chunk coordinate of the south-west corner of the region that a client
    /// loads around this tile.
    pub fn region_x(&self) -> i32 {
        self.chunk_x() - 6
    }

    pub fn region_y(&self) -> i32 {
        self.chunk_y() - 6
    }

    /// X relative to the region loaded around `base`.
    pub fn local_x(&self, base: &Position) -> i32 {
        self.x - 8 * base.region_x()
    }

    pub fn local_y(&self, base: &Position) -> i32 {
        self.y - 8 * base.region_y()
    }

    pub fn delta(&self, other: &Position) -> (i32, i32) {
        (other.x - self.x, other.y - self.y)
    }

    /// Whether `other` is on the same plane and inside the view square.
    pub fn is_viewable_from(&self, other: &Position) -> bool {
        if self.z != other.z {
            return false;
        }
        let (dx, dy) = self.delta(other);
        dx.abs() <= VIEW_DISTANCE && dy.abs() <= VIEW_DISTANCE
    }

    pub fn translate(&self, dx: i32, dy: i32) -> Self {
        Self::new(self.x + dx, self.y + dy, self.z)
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// The eight movement directions, numbered as the protocol numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    NorthWest = 0,
    North = 1,
    NorthEast = 2,
    West = 3,
    East = 4,
    SouthWest = 5,
    South = 6,
    SouthEast = 7,
}

impl Direction {
    /// Direction of a unit step, `None` for a zero step.
    pub fn from_delta(dx: i32, dy: i32) -> Option<Self> {
        use std::cmp::Ordering::*;
        match (dx.cmp(&0), dy.cmp(&0)) {
            (Less, Greater) => Some(Direction::NorthWest),
            (Equal, Greater) => Some(Direction::North),
            (Greater, Greater) => Some(Direction::NorthEast),
            (Less, Equal) => Some(Direction::West),
            (Greater, Equal) => Some(Direction::East),
            (Less, Less) => Some(Direction::SouthWest),
            (Equal, Less) => Some(Direction::South),
            (Greater, Less) => Some(Direction::SouthEast),
            (Equal, Equal) => None,
        }
    }

    pub fn delta(self) -> (i32, i32) {
        match self {
            Direction::NorthWest => (-1, 1),
            Direction::North => (0, 1),
            Direction::NorthEast => (1, 1),
            Direction::West => (-1, 0),
            Direction::East => (1, 0),
            Direction::SouthWest => (-1, -1),
            Direction::South => (0, -1),
            Direction::SouthEast => (1, -1),
        }
    }

    pub fn id(self) -> u32 {
        self as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_and_local_coordinates() {
        let pos = Position::new(3222, 3218, 0);
        assert_eq!(pos.chunk_x(), 402);
        assert_eq!(pos.region_x(), 396);
        assert_eq!(pos.local_x(&pos), 3222 - 396 * 8);
        assert_eq!(pos.local_x(&pos), 54);
        assert_eq!(pos.local_y(&pos), 3218 - 396 * 8);
    }

    #[test]
    fn test_viewable() {
        let a = Position::new(3200, 3200, 0);
        assert!(a.is_viewable_from(&Position::new(3215, 3185, 0)));
        assert!(!a.is_viewable_from(&Position::new(3216, 3200, 0)));
        assert!(!a.is_viewable_from(&Position::new(3200, 3200, 1)));
    }

    #[test]
    fn test_direction_round_trip() {
        for dx in -1..=1 {
            for dy in -1..=1 {
                match Direction::from_delta(dx, dy) {
                    Some(dir) => assert_eq!(dir.delta(), (dx, dy)),
                    None => assert_eq!((dx, dy), (0, 0)),
                }
            }
        }
        assert_eq!(Direction::from_delta(1, 1).unwrap().id(), 2);
        assert_eq!(Direction::from_delta(0, -1).unwrap().id(), 6);
    }
}
