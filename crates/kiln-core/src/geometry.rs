use std::ops::Mul;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect<T> {
    pub x: T,
    pub y: T,
    pub width: T,
    pub height: T,
}

impl<T> Rect<T> {
    pub fn new(x: T, y: T, width: T, height: T) -> Self {
        Rect {
            x,
            y,
            width,
            height,
        }
    }
}

impl Rect<u32> {
    pub const ZERO: Self = Rect {
        x: 0,
        y: 0,
        width: 0,
        height: 0,
    };

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Smallest rect covering both. Empty rects contribute nothing.
    pub fn union(&self, other: &Self) -> Self {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        Rect {
            x,
            y,
            width: self.right().max(other.right()) - x,
            height: self.bottom().max(other.bottom()) - y,
        }
    }

    /// Overlap of the two rects; [`Rect::ZERO`] when they are disjoint.
    pub fn intersection(&self, other: &Self) -> Self {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());
        if x2 <= x1 || y2 <= y1 {
            return Self::ZERO;
        }
        Rect {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        }
    }

    pub fn contains(&self, other: &Self) -> bool {
        !other.is_empty()
            && self.x <= other.x
            && self.y <= other.y
            && self.right() >= other.right()
            && self.bottom() >= other.bottom()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Size<T> {
    pub width: T,
    pub height: T,
}

impl<T> Size<T> {
    pub fn new(width: T, height: T) -> Self {
        Size { width, height }
    }

    pub fn cast<U: From<T>>(self) -> Size<U> {
        Size {
            width: U::from(self.width),
            height: U::from(self.height),
        }
    }
}

impl<T: Mul + Copy> Mul<T> for Size<T> {
    type Output = Size<<T as Mul>::Output>;

    fn mul(self, rhs: T) -> Self::Output {
        Size {
            width: self.width * rhs,
            height: self.height * rhs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pos<T> {
    pub x: T,
    pub y: T,
}

impl<T> Pos<T> {
    pub fn new(x: T, y: T) -> Self {
        Pos { x, y }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_union() {
        let a = Rect::new(0u32, 0, 16, 16);
        let b = Rect::new(32u32, 8, 16, 16);
        let u = a.union(&b);
        assert_eq!(u, Rect::new(0, 0, 48, 24));
    }

    #[test]
    fn test_rect_union_with_empty() {
        let a = Rect::new(4u32, 4, 8, 8);
        assert_eq!(a.union(&Rect::ZERO), a);
        assert_eq!(Rect::ZERO.union(&a), a);
    }

    #[test]
    fn test_rect_intersection_disjoint() {
        let a = Rect::new(0u32, 0, 16, 16);
        let b = Rect::new(64u32, 64, 16, 16);
        assert!(a.intersection(&b).is_empty());
    }

    #[test]
    fn test_rect_intersection_clamps() {
        let a = Rect::new(0u32, 0, 100, 100);
        let b = Rect::new(96u32, 32, 32, 32);
        assert_eq!(a.intersection(&b), Rect::new(96, 32, 4, 32));
    }

    #[test]
    fn test_rect_contains() {
        let a = Rect::new(0u32, 0, 64, 64);
        assert!(a.contains(&Rect::new(16, 16, 32, 32)));
        assert!(!a.contains(&Rect::new(48, 48, 32, 32)));
    }
}
