//! Signature placement.
//!
//! The caller picks a spot on a page preview once per batch, as fractions of the page size.
//! [`PlacementResolver`] turns that anchor into a rectangle in each document's own user space,
//! so a batch mixing A4, Letter and landscape pages puts the box in the same relative place on
//! every one of them.
//!
//! Anchors describe the page as a viewer shows it. On a page with `/Rotate` the anchor is turned
//! back into unrotated user space and the box is laid out with its sides swapped for quarter
//! turns, so it still reads left to right on screen.

use crate::document::PageNode;
use crate::error::{Error, Result, SignError};
use crate::geometry::Rect;
use crate::object::ObjectRef;
use serde::{Deserialize, Serialize};

/// Where the visible signature goes, relative to the page.
///
/// `normalized_x` runs left to right and `normalized_y` bottom to top, both in `[0, 1]`, on the
/// page as displayed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawAnchor", into = "RawAnchor")]
pub struct SignatureAnchor {
    normalized_x: f64,
    normalized_y: f64,
    page_index: usize,
}

#[derive(Serialize, Deserialize)]
struct RawAnchor {
    x: f64,
    y: f64,
    page: usize,
}

impl TryFrom<RawAnchor> for SignatureAnchor {
    type Error = Error;

    fn try_from(raw: RawAnchor) -> Result<Self> {
        SignatureAnchor::new(raw.x, raw.y, raw.page)
    }
}

impl From<SignatureAnchor> for RawAnchor {
    fn from(anchor: SignatureAnchor) -> Self {
        RawAnchor {
            x: anchor.normalized_x,
            y: anchor.normalized_y,
            page: anchor.page_index,
        }
    }
}

impl SignatureAnchor {
    /// Create an anchor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when a coordinate is NaN or outside `[0, 1]`.
    pub fn new(normalized_x: f64, normalized_y: f64, page_index: usize) -> Result<Self> {
        for (name, value) in [("x", normalized_x), ("y", normalized_y)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::InvalidArgument(format!(
                    "normalized {} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        Ok(Self {
            normalized_x,
            normalized_y,
            page_index,
        })
    }

    /// Horizontal position as a fraction of page width.
    pub fn normalized_x(&self) -> f64 {
        self.normalized_x
    }

    /// Vertical position as a fraction of page height, from the bottom.
    pub fn normalized_y(&self) -> f64 {
        self.normalized_y
    }

    /// Zero-based page index.
    pub fn page_index(&self) -> usize {
        self.page_index
    }
}

/// A resolved placement for one document.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlacementRect {
    /// Zero-based page index
    pub page_index: usize,
    /// The page object the widget is attached to
    pub page: ObjectRef,
    /// Widget rectangle in the page's user space
    pub rect: Rect,
    /// Clockwise page rotation the appearance must counter (0, 90, 180 or 270)
    pub rotation: i32,
}

impl PlacementRect {
    /// Appearance width and height as seen on screen.
    pub fn display_size(&self) -> (f64, f64) {
        match self.rotation {
            90 | 270 => (self.rect.height, self.rect.width),
            _ => (self.rect.width, self.rect.height),
        }
    }
}

/// Converts anchors into page-space rectangles of a fixed size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlacementResolver {
    box_width: f64,
    box_height: f64,
}

impl Default for PlacementResolver {
    fn default() -> Self {
        Self::new(200.0, 50.0)
    }
}

impl PlacementResolver {
    /// Resolver for a `width` x `height` appearance box, in points.
    pub fn new(box_width: f64, box_height: f64) -> Self {
        Self {
            box_width: box_width.max(1.0),
            box_height: box_height.max(1.0),
        }
    }

    /// Appearance box size.
    pub fn box_size(&self) -> (f64, f64) {
        (self.box_width, self.box_height)
    }

    /// Resolve `anchor` against a document's pages.
    ///
    /// The box is centered on the anchor point and then pushed back inside the visible page
    /// area; a box larger than the page shrinks to the page.
    ///
    /// # Errors
    ///
    /// [`SignError::PageIndexOutOfRange`] when the anchor's page does not exist.
    pub fn resolve(
        &self,
        anchor: &SignatureAnchor,
        pages: &[PageNode],
    ) -> std::result::Result<PlacementRect, SignError> {
        let page = pages
            .get(anchor.page_index)
            .ok_or(SignError::PageIndexOutOfRange {
                page_index: anchor.page_index,
                page_count: pages.len(),
            })?;

        let visible = page.geometry.visible_box();
        let rotation = page.geometry.quarter_turn();
        let (u, v) = (anchor.normalized_x, anchor.normalized_y);
        // Viewer fractions to unrotated fractions of the visible box
        let (fx, fy) = match rotation {
            90 => (1.0 - v, u),
            180 => (1.0 - u, 1.0 - v),
            270 => (v, 1.0 - u),
            _ => (u, v),
        };
        let center_x = visible.left() + fx * visible.width;
        let center_y = visible.bottom() + fy * visible.height;

        let (box_width, box_height) = match rotation {
            90 | 270 => (self.box_height, self.box_width),
            _ => (self.box_width, self.box_height),
        };
        let width = box_width.min(visible.width);
        let height = box_height.min(visible.height);
        let x = clamp(center_x - width / 2.0, visible.left(), visible.right() - width);
        let y = clamp(center_y - height / 2.0, visible.bottom(), visible.top() - height);

        Ok(PlacementRect {
            page_index: anchor.page_index,
            page: page.reference,
            rect: Rect::new(x, y, width, height),
            rotation,
        })
    }
}

fn clamp(value: f64, low: f64, high: f64) -> f64 {
    value.max(low).min(high.max(low))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::PageGeometry;
    use crate::object::Dict;

    fn page(width: f64, height: f64) -> PageNode {
        rotated(width, height, 0)
    }

    fn rotated(width: f64, height: f64, rotation: i32) -> PageNode {
        PageNode {
            reference: ObjectRef::new(3, 0),
            dict: Dict::new(),
            geometry: PageGeometry {
                media_box: Rect::new(0.0, 0.0, width, height),
                crop_box: None,
                rotation,
            },
        }
    }

    #[test]
    fn test_anchor_rejects_out_of_range() {
        assert!(SignatureAnchor::new(1.01, 0.5, 0).is_err());
        assert!(SignatureAnchor::new(0.5, -0.1, 0).is_err());
        assert!(SignatureAnchor::new(f64::NAN, 0.5, 0).is_err());
        assert!(SignatureAnchor::new(0.0, 1.0, 3).is_ok());
    }

    #[test]
    fn test_center_of_letter_page() {
        let anchor = SignatureAnchor::new(0.5, 0.5, 0).unwrap();
        let placed = PlacementResolver::default().resolve(&anchor, &[page(612.0, 792.0)]).unwrap();
        assert_eq!(placed.rect, Rect::new(206.0, 371.0, 200.0, 50.0));
        assert_eq!(placed.page, ObjectRef::new(3, 0));
    }

    #[test]
    fn test_corner_is_clamped() {
        let anchor = SignatureAnchor::new(1.0, 1.0, 0).unwrap();
        let placed = PlacementResolver::default().resolve(&anchor, &[page(612.0, 792.0)]).unwrap();
        assert_eq!(placed.rect, Rect::new(412.0, 742.0, 200.0, 50.0));

        let anchor = SignatureAnchor::new(0.0, 0.0, 0).unwrap();
        let placed = PlacementResolver::default().resolve(&anchor, &[page(612.0, 792.0)]).unwrap();
        assert_eq!(placed.rect, Rect::new(0.0, 0.0, 200.0, 50.0));
    }

    #[test]
    fn test_box_larger_than_page_shrinks() {
        let anchor = SignatureAnchor::new(0.3, 0.7, 0).unwrap();
        let placed = PlacementResolver::new(500.0, 80.0)
            .resolve(&anchor, &[page(144.0, 72.0)])
            .unwrap();
        assert_eq!(placed.rect, Rect::new(0.0, 0.0, 144.0, 72.0));
    }

    #[test]
    fn test_offset_crop_box() {
        let mut p = page(612.0, 792.0);
        p.geometry.crop_box = Some(Rect::new(100.0, 100.0, 400.0, 600.0));
        let anchor = SignatureAnchor::new(0.0, 0.0, 0).unwrap();
        let placed = PlacementResolver::default().resolve(&anchor, &[p]).unwrap();
        assert_eq!(placed.rect, Rect::new(100.0, 100.0, 200.0, 50.0));
    }

    #[test]
    fn test_rotated_pages_follow_the_viewer() {
        // A portrait sheet shown as landscape; the anchor is near the displayed top-left corner
        let anchor = SignatureAnchor::new(0.0, 1.0, 0).unwrap();
        let resolver = PlacementResolver::default();

        let placed = resolver.resolve(&anchor, &[rotated(612.0, 792.0, 90)]).unwrap();
        assert_eq!(placed.rotation, 90);
        // Displayed top edge is user x = 0, displayed left edge is user y = 0
        assert_eq!(placed.rect, Rect::new(0.0, 0.0, 50.0, 200.0));
        assert_eq!(placed.display_size(), (200.0, 50.0));

        let placed = resolver.resolve(&anchor, &[rotated(612.0, 792.0, 180)]).unwrap();
        assert_eq!(placed.rect, Rect::new(412.0, 0.0, 200.0, 50.0));

        let placed = resolver.resolve(&anchor, &[rotated(612.0, 792.0, 270)]).unwrap();
        assert_eq!(placed.rect, Rect::new(562.0, 592.0, 50.0, 200.0));
        assert_eq!(placed.display_size(), (200.0, 50.0));
    }

    #[test]
    fn test_rotated_center_matches_unrotated_center() {
        let anchor = SignatureAnchor::new(0.5, 0.5, 0).unwrap();
        let placed = PlacementResolver::default()
            .resolve(&anchor, &[rotated(612.0, 792.0, -90)])
            .unwrap();
        assert_eq!(placed.rotation, 270);
        assert_eq!(placed.rect, Rect::new(281.0, 296.0, 50.0, 200.0));
    }

    #[test]
    fn test_page_out_of_range() {
        let anchor = SignatureAnchor::new(0.5, 0.9, 2).unwrap();
        let err = PlacementResolver::default()
            .resolve(&anchor, &[page(612.0, 792.0), page(612.0, 792.0)])
            .unwrap_err();
        assert_eq!(
            err,
            SignError::PageIndexOutOfRange {
                page_index: 2,
                page_count: 2
            }
        );
    }

    #[test]
    fn test_anchor_json() {
        let anchor: SignatureAnchor = serde_json::from_str(r#"{"x":0.5,"y":0.9,"page":0}"#).unwrap();
        assert_eq!(anchor.normalized_y(), 0.9);
        assert!(serde_json::from_str::<SignatureAnchor>(r#"{"x":2.0,"y":0.9,"page":0}"#).is_err());
    }
}
