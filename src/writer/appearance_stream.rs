//! Appearance streams for visible signatures.
//!
//! The appearance is a Form XObject referenced from the widget's `/AP /N`. It draws a thin
//! border and a few lines of Helvetica text (signer, date, reason, location). Helvetica is one of
//! the standard 14 fonts, so nothing gets embedded; text is encoded as WinAnsi and the font size
//! shrinks until every line fits the box.
//!
//! On a rotated page the form carries a `/Matrix` turning it against the page rotation, so the
//! text stays upright in the viewer.
//!
//! PDF Spec: ISO 32000-1:2008, Section 12.5.5 (Appearance Streams)

use super::object_serializer::format_real;
use crate::geometry::Rect;
use crate::object::{Dict, Object};

/// Resource name of the font inside the appearance.
const FONT_RESOURCE: &str = "Helv";

/// Helvetica advance widths for ASCII 32..=126, in 1/1000 em.
const HELVETICA_WIDTHS: [u16; 95] = [
    278, 278, 355, 556, 556, 889, 667, 191, 333, 333, 389, 584, 278, 333, 278, 278, // ' '..'/'
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556, 278, 278, 584, 584, 584, 556, // '0'..'?'
    1015, 667, 667, 722, 722, 667, 611, 778, 722, 278, 500, 667, 556, 833, 722, 778, // '@'..'O'
    667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611, 278, 278, 278, 469, 556, // 'P'..'_'
    333, 556, 556, 500, 556, 556, 278, 556, 556, 222, 222, 500, 222, 833, 556, 556, // '`'..'o'
    556, 556, 333, 500, 278, 556, 500, 722, 500, 500, 500, 334, 260, 334, 584, // 'p'..'~'
];

/// Builder for a signature widget's normal appearance.
#[derive(Debug, Clone)]
pub struct AppearanceStreamBuilder {
    /// Bounding box, always anchored at the origin
    bbox: Rect,
    /// Text lines, top to bottom
    lines: Vec<String>,
    /// Upper bound for the font size
    max_font_size: f64,
    /// Border width; zero draws no border
    border_width: f64,
    /// Inner padding
    padding: f64,
    /// Clockwise page rotation to counter
    rotation: i32,
}

impl AppearanceStreamBuilder {
    /// Appearance for a widget of the given size.
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            bbox: Rect::new(0.0, 0.0, width.max(1.0), height.max(1.0)),
            lines: Vec::new(),
            max_font_size: 10.0,
            border_width: 1.0,
            padding: 3.0,
            rotation: 0,
        }
    }

    /// Append a line of text. Empty lines are skipped.
    pub fn line(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        if !text.trim().is_empty() {
            self.lines.push(text);
        }
        self
    }

    /// Set the largest font size to use.
    pub fn with_max_font_size(mut self, size: f64) -> Self {
        self.max_font_size = size.max(1.0);
        self
    }

    /// Set the border width.
    pub fn with_border_width(mut self, width: f64) -> Self {
        self.border_width = width.max(0.0);
        self
    }

    /// Counter a clockwise page rotation of `degrees` (a multiple of 90).
    pub fn with_rotation(mut self, degrees: i32) -> Self {
        self.rotation = degrees.rem_euclid(360) / 90 * 90;
        self
    }

    /// Form matrix that rotates the box counterclockwise back onto the origin.
    pub fn matrix(&self) -> Option<[f64; 6]> {
        let (w, h) = (self.bbox.width, self.bbox.height);
        match self.rotation {
            90 => Some([0.0, 1.0, -1.0, 0.0, h, 0.0]),
            180 => Some([-1.0, 0.0, 0.0, -1.0, w, h]),
            270 => Some([0.0, -1.0, 1.0, 0.0, 0.0, w]),
            _ => None,
        }
    }

    /// Bounding box of the appearance.
    pub fn bbox(&self) -> Rect {
        self.bbox
    }

    /// Font size at which every line fits inside the padded box.
    pub fn font_size(&self) -> f64 {
        if self.lines.is_empty() {
            return self.max_font_size;
        }
        let inner_width = (self.bbox.width - 2.0 * self.padding).max(1.0);
        let inner_height = (self.bbox.height - 2.0 * self.padding).max(1.0);

        let by_height = inner_height / (self.lines.len() as f64 * 1.2);
        let widest = self
            .lines
            .iter()
            .map(|l| text_width(l, 1.0))
            .fold(0.0_f64, f64::max);
        let by_width = if widest > 0.0 {
            inner_width / widest
        } else {
            self.max_font_size
        };
        self.max_font_size.min(by_height).min(by_width).max(1.0)
    }

    /// Content stream operators.
    pub fn content(&self) -> Vec<u8> {
        let mut s = String::new();
        let (w, h) = (self.bbox.width, self.bbox.height);

        if self.border_width > 0.0 {
            let half = self.border_width / 2.0;
            s.push_str("0.2 0.2 0.5 RG\n");
            s.push_str(&format!("{} w\n", format_real(self.border_width)));
            s.push_str(&format!(
                "{} {} {} {} re S\n",
                format_real(half),
                format_real(half),
                format_real(w - self.border_width),
                format_real(h - self.border_width)
            ));
        }

        if !self.lines.is_empty() {
            let size = self.font_size();
            let leading = size * 1.2;
            let first_baseline = h - self.padding - size;

            s.push_str("BT\n0 g\n");
            s.push_str(&format!("/{} {} Tf\n", FONT_RESOURCE, format_real(size)));
            s.push_str(&format!("{} TL\n", format_real(leading)));
            s.push_str(&format!(
                "{} {} Td\n",
                format_real(self.padding),
                format_real(first_baseline)
            ));
            for (i, line) in self.lines.iter().enumerate() {
                if i > 0 {
                    s.push_str("T*\n");
                }
                s.push_str(&format!("({}) Tj\n", escape_win_ansi(line)));
            }
            s.push_str("ET\n");
        }

        // Everything is ASCII: non-ASCII text went through octal escapes
        s.into_bytes()
    }

    /// Build the Form XObject dictionary and content bytes.
    pub fn build(&self) -> (Dict, Vec<u8>) {
        let mut font = Dict::new();
        font.insert("Type".to_string(), Object::name("Font"));
        font.insert("Subtype".to_string(), Object::name("Type1"));
        font.insert("BaseFont".to_string(), Object::name("Helvetica"));
        font.insert("Encoding".to_string(), Object::name("WinAnsiEncoding"));

        let mut fonts = Dict::new();
        fonts.insert(FONT_RESOURCE.to_string(), Object::Dictionary(font));
        let mut resources = Dict::new();
        resources.insert("Font".to_string(), Object::Dictionary(fonts));

        let mut dict = Dict::new();
        dict.insert("Type".to_string(), Object::name("XObject"));
        dict.insert("Subtype".to_string(), Object::name("Form"));
        dict.insert("FormType".to_string(), Object::Integer(1));
        dict.insert("BBox".to_string(), self.bbox.to_pdf_array());
        if let Some(matrix) = self.matrix() {
            dict.insert(
                "Matrix".to_string(),
                Object::Array(matrix.iter().map(|&m| Object::Real(m)).collect()),
            );
        }
        dict.insert("Resources".to_string(), Object::Dictionary(resources));

        (dict, self.content())
    }

    /// Build the appearance as a stream object.
    pub fn into_stream(self) -> Object {
        let (dict, content) = self.build();
        Object::Stream {
            dict,
            data: content.into(),
        }
    }
}

/// Width of `text` in Helvetica at `font_size`.
pub fn text_width(text: &str, font_size: f64) -> f64 {
    let units: u32 = text
        .chars()
        .map(|c| match c as u32 {
            code @ 32..=126 => u32::from(HELVETICA_WIDTHS[(code - 32) as usize]),
            _ => 556,
        })
        .sum();
    f64::from(units) * font_size / 1000.0
}

/// Encode as a WinAnsi literal string body.
///
/// Latin-1 characters keep their code, anything else becomes `?`.
fn escape_win_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '(' => out.push_str("\\("),
            ')' => out.push_str("\\)"),
            ' '..='~' => out.push(c),
            '\u{A0}'..='\u{FF}' => out.push_str(&format!("\\{:03o}", c as u32)),
            _ => out.push('?'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_width() {
        assert_eq!(text_width("A", 1000.0), 667.0);
        assert!((text_width("Hi", 10.0) - 9.44).abs() < 1e-9);
    }

    #[test]
    fn test_escape_win_ansi() {
        assert_eq!(escape_win_ansi("Approved (final)"), "Approved \\(final\\)");
        assert_eq!(escape_win_ansi("Zürich"), "Z\\374rich");
        assert_eq!(escape_win_ansi("東京"), "??");
    }

    #[test]
    fn test_long_lines_shrink_the_font() {
        let short = AppearanceStreamBuilder::new(200.0, 50.0).line("Alice");
        assert_eq!(short.font_size(), 10.0);

        let long = AppearanceStreamBuilder::new(200.0, 50.0)
            .line("Digitally signed by a signer with an extremely long common name");
        let size = long.font_size();
        assert!(size < 10.0);
        let widest = text_width("Digitally signed by a signer with an extremely long common name", size);
        assert!(widest <= 200.0 - 6.0 + 1e-9);
    }

    #[test]
    fn test_many_lines_fit_vertically() {
        let builder = (0..6).fold(AppearanceStreamBuilder::new(200.0, 50.0), |b, i| {
            b.line(format!("line {}", i))
        });
        let size = builder.font_size();
        assert!(size * 1.2 * 6.0 <= 50.0 - 6.0 + 1e-9);
    }

    #[test]
    fn test_build_form_xobject() {
        let ap = AppearanceStreamBuilder::new(200.0, 50.0)
            .line("Digitally signed by Alice")
            .line("")
            .line("Reason: Approved");
        let (dict, content) = ap.build();

        assert_eq!(dict.get("Subtype").and_then(Object::as_name), Some("Form"));
        assert_eq!(Rect::from_pdf_array(&dict["BBox"]), Some(Rect::new(0.0, 0.0, 200.0, 50.0)));
        let font = dict["Resources"].get("Font").and_then(|f| f.get("Helv")).unwrap();
        assert_eq!(font.get("BaseFont").and_then(Object::as_name), Some("Helvetica"));

        let text = String::from_utf8(content).unwrap();
        assert!(text.contains("re S"));
        assert!(text.contains("/Helv 10 Tf"));
        assert!(text.contains("(Digitally signed by Alice) Tj"));
        assert_eq!(text.matches("T*").count(), 1);
    }

    #[test]
    fn test_rotation_adds_a_matrix() {
        let upright = AppearanceStreamBuilder::new(200.0, 50.0).line("x");
        assert!(!upright.build().0.contains_key("Matrix"));

        let turned = AppearanceStreamBuilder::new(200.0, 50.0).with_rotation(90).line("x");
        assert_eq!(turned.matrix(), Some([0.0, 1.0, -1.0, 0.0, 50.0, 0.0]));
        let (dict, _) = turned.build();
        let Object::Array(values) = &dict["Matrix"] else {
            panic!("matrix is not an array");
        };
        assert_eq!(values.len(), 6);
        // The box itself stays upright in form space
        assert_eq!(Rect::from_pdf_array(&dict["BBox"]), Some(Rect::new(0.0, 0.0, 200.0, 50.0)));

        assert_eq!(
            AppearanceStreamBuilder::new(200.0, 50.0).with_rotation(-90).matrix(),
            Some([0.0, -1.0, 1.0, 0.0, 0.0, 200.0])
        );
        assert_eq!(
            AppearanceStreamBuilder::new(200.0, 50.0).with_rotation(180).matrix(),
            Some([-1.0, 0.0, 0.0, -1.0, 200.0, 50.0])
        );
    }

    #[test]
    fn test_no_border() {
        let ap = AppearanceStreamBuilder::new(100.0, 20.0).with_border_width(0.0).line("x");
        let text = String::from_utf8(ap.content()).unwrap();
        assert!(!text.contains("re S"));
    }
}
