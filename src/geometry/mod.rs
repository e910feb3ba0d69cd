//! Geometric primitives in PDF user space.
//!
//! PDF user space has its origin at the bottom-left of the page with y growing upwards, so a
//! [`Rect`] is stored as its lower-left corner plus a size.

use crate::object::Object;

/// A 2D point in user space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    /// X coordinate
    pub x: f64,
    /// Y coordinate
    pub y: f64,
}

impl Point {
    /// Create a new point.
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A rectangle in user space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    /// X coordinate of the lower-left corner
    pub x: f64,
    /// Y coordinate of the lower-left corner
    pub y: f64,
    /// Width of rectangle
    pub width: f64,
    /// Height of rectangle
    pub height: f64,
}

impl Rect {
    /// Create a new rectangle from its lower-left corner and size.
    ///
    /// # Examples
    ///
    /// ```
    /// use pdf_batch_signer::geometry::Rect;
    ///
    /// let rect = Rect::new(0.0, 0.0, 100.0, 50.0);
    /// assert_eq!(rect.top(), 50.0);
    /// ```
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Create a rectangle from two opposite corners in any order, as PDF rectangles are written.
    ///
    /// # Examples
    ///
    /// ```
    /// use pdf_batch_signer::geometry::Rect;
    ///
    /// let rect = Rect::from_points(612.0, 792.0, 0.0, 0.0);
    /// assert_eq!(rect, Rect::new(0.0, 0.0, 612.0, 792.0));
    /// ```
    pub fn from_points(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self {
            x: x0.min(x1),
            y: y0.min(y1),
            width: (x1 - x0).abs(),
            height: (y1 - y0).abs(),
        }
    }

    /// Read a `[llx lly urx ury]` array.
    pub fn from_pdf_array(obj: &Object) -> Option<Self> {
        let items = obj.as_array()?;
        if items.len() != 4 {
            return None;
        }
        let n: Vec<f64> = items.iter().filter_map(Object::as_number).collect();
        if n.len() != 4 || n.iter().any(|v| !v.is_finite()) {
            return None;
        }
        Some(Self::from_points(n[0], n[1], n[2], n[3]))
    }

    /// Write as a `[llx lly urx ury]` array.
    pub fn to_pdf_array(&self) -> Object {
        Object::Array(vec![
            Object::Real(self.left()),
            Object::Real(self.bottom()),
            Object::Real(self.right()),
            Object::Real(self.top()),
        ])
    }

    /// Left edge.
    pub fn left(&self) -> f64 {
        self.x
    }

    /// Right edge.
    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    /// Bottom edge.
    pub fn bottom(&self) -> f64 {
        self.y
    }

    /// Top edge.
    pub fn top(&self) -> f64 {
        self.y + self.height
    }

    /// Center point.
    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Whether `other` lies entirely within this rectangle.
    pub fn contains_rect(&self, other: &Rect) -> bool {
        other.left() >= self.left()
            && other.right() <= self.right()
            && other.bottom() >= self.bottom()
            && other.top() <= self.top()
    }

    /// Overlap of two rectangles, or `None` if they do not overlap.
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let left = self.left().max(other.left());
        let right = self.right().min(other.right());
        let bottom = self.bottom().max(other.bottom());
        let top = self.top().min(other.top());
        if right > left && top > bottom {
            Some(Rect::from_points(left, bottom, right, top))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_pdf_array() {
        let arr = Object::Array(vec![
            Object::Integer(0),
            Object::Integer(0),
            Object::Real(595.28),
            Object::Real(841.89),
        ]);
        let rect = Rect::from_pdf_array(&arr).unwrap();
        assert_eq!(rect.width, 595.28);
        assert_eq!(rect.height, 841.89);
    }

    #[test]
    fn test_from_pdf_array_rejects_bad_input() {
        assert!(Rect::from_pdf_array(&Object::Array(vec![Object::Integer(0); 3])).is_none());
        assert!(Rect::from_pdf_array(&Object::Array(vec![
            Object::Integer(0),
            Object::Integer(0),
            Object::name("Wide"),
            Object::Integer(10),
        ]))
        .is_none());
    }

    #[test]
    fn test_intersection() {
        let a = Rect::new(0.0, 0.0, 100.0, 100.0);
        let b = Rect::new(50.0, 50.0, 100.0, 100.0);
        assert_eq!(a.intersection(&b), Some(Rect::new(50.0, 50.0, 50.0, 50.0)));
        assert_eq!(a.intersection(&Rect::new(200.0, 0.0, 5.0, 5.0)), None);
    }

    #[test]
    fn test_contains_rect_and_center() {
        let page = Rect::new(0.0, 0.0, 612.0, 792.0);
        assert!(page.contains_rect(&Rect::new(0.0, 742.0, 200.0, 50.0)));
        assert!(!page.contains_rect(&Rect::new(500.0, 0.0, 200.0, 50.0)));
        assert_eq!(page.center(), Point::new(306.0, 396.0));
    }
}
