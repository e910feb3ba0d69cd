//! Document loading.
//!
//! [`DocumentLoader`] reads a PDF into memory and parses just enough of it to sign: the
//! cross-reference chain, the trailer, the catalog and the page tree. The raw bytes are kept
//! untouched in the resulting [`SourceDocument`]; signing appends to them and never rewrites
//! them, which is what keeps every unrelated object byte-for-byte identical.

use crate::error::{Error, Result, SignError};
use crate::geometry::Rect;
use crate::lexer::{Token, skip_ws, token};
use crate::object::{Dict, Object, ObjectRef};
use crate::objstm::parse_object_stream;
use crate::parser::parse_indirect_object;
use crate::xref::{CrossRefTable, XRefEntry, XrefKind, find_startxref, parse_xref};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Maximum depth of the page tree.
const MAX_RECURSION_DEPTH: u32 = 64;

/// US Letter, used when no page tree node carries a MediaBox.
const DEFAULT_MEDIA_BOX: Rect = Rect {
    x: 0.0,
    y: 0.0,
    width: 612.0,
    height: 792.0,
};

/// Page boundaries after inheritance through the page tree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageGeometry {
    /// Media box defining the page boundaries
    pub media_box: Rect,
    /// Crop box if specified (for visible area)
    pub crop_box: Option<Rect>,
    /// Page rotation in degrees (0, 90, 180, 270)
    pub rotation: i32,
}

impl PageGeometry {
    /// The region a viewer shows: the crop box clipped to the media box, or the media box.
    pub fn visible_box(&self) -> Rect {
        self.crop_box
            .and_then(|crop| crop.intersection(&self.media_box))
            .unwrap_or(self.media_box)
    }

    /// Width and height of the visible box.
    pub fn size(&self) -> (f64, f64) {
        let visible = self.visible_box();
        (visible.width, visible.height)
    }

    /// Clockwise display rotation snapped to 0, 90, 180 or 270.
    pub fn quarter_turn(&self) -> i32 {
        self.rotation.rem_euclid(360) / 90 * 90
    }

    /// Width and height as a viewer shows the page, after rotation.
    pub fn display_size(&self) -> (f64, f64) {
        let (width, height) = self.size();
        match self.quarter_turn() {
            90 | 270 => (height, width),
            _ => (width, height),
        }
    }
}

/// A leaf of the page tree.
#[derive(Debug, Clone)]
pub struct PageNode {
    /// The page object
    pub reference: ObjectRef,
    /// The page dictionary as stored, without inherited attributes
    pub dict: Dict,
    /// Inherited geometry
    pub geometry: PageGeometry,
}

/// A parsed PDF, ready for an incremental update.
pub struct SourceDocument {
    path: PathBuf,
    raw: Bytes,
    version: (u8, u8),
    xref: CrossRefTable,
    catalog_ref: ObjectRef,
    catalog: Dict,
    pages: Vec<PageNode>,
    object_streams: Mutex<HashMap<u32, Arc<HashMap<u32, Object>>>>,
}

impl std::fmt::Debug for SourceDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceDocument")
            .field("path", &self.path)
            .field("bytes", &self.raw.len())
            .field("version", &self.version)
            .field("xref_kind", &self.xref.kind())
            .field("pages", &self.pages.len())
            .finish_non_exhaustive()
    }
}

impl SourceDocument {
    /// Parse a document from bytes already in memory.
    ///
    /// # Errors
    ///
    /// Fails on a bad header, a missing or corrupt cross-reference chain, entries that do not
    /// point at their objects, an `/Encrypt` entry, or an unreadable catalog or page tree.
    pub fn from_bytes(path: impl Into<PathBuf>, raw: impl Into<Bytes>) -> Result<Self> {
        let path = path.into();
        let raw = raw.into();
        let version = parse_header(&raw)?;

        let startxref = find_startxref(&raw)?;
        let xref = parse_xref(&raw, startxref)?;
        if xref.trailer().contains_key("Encrypt") {
            return Err(Error::Encrypted);
        }
        validate_xref_offsets(&raw, &xref)?;

        let catalog_ref = xref
            .trailer()
            .get("Root")
            .and_then(Object::as_reference)
            .ok_or_else(|| Error::InvalidPdf("trailer missing /Root".to_string()))?;

        let mut doc = Self {
            path,
            raw,
            version,
            xref,
            catalog_ref,
            catalog: Dict::new(),
            pages: Vec::new(),
            object_streams: Mutex::new(HashMap::new()),
        };

        doc.catalog = match doc.load_object(catalog_ref)? {
            Object::Dictionary(d) => d,
            other => {
                return Err(Error::InvalidObjectType {
                    expected: "Dictionary".to_string(),
                    found: other.type_name().to_string(),
                });
            },
        };
        doc.pages = doc.collect_pages()?;
        if doc.pages.is_empty() {
            return Err(Error::InvalidPdf("document has no pages".to_string()));
        }

        log::debug!(
            "loaded {}: PDF {}.{}, {} page(s), {:?} xref over {} section(s)",
            doc.path.display(),
            doc.version.0,
            doc.version.1,
            doc.pages.len(),
            doc.xref.kind(),
            doc.xref.section_count()
        );
        Ok(doc)
    }

    /// Source path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The bytes as read from disk.
    pub fn raw_bytes(&self) -> &Bytes {
        &self.raw
    }

    /// Serialize the unmodified document. This is the input, byte for byte.
    pub fn to_bytes(&self) -> Bytes {
        self.raw.clone()
    }

    /// PDF version from the header.
    pub fn version(&self) -> (u8, u8) {
        self.version
    }

    /// Merged cross-reference data.
    pub fn xref(&self) -> &CrossRefTable {
        &self.xref
    }

    /// Trailer of the latest cross-reference section.
    pub fn trailer(&self) -> &Dict {
        self.xref.trailer()
    }

    /// Format of the latest cross-reference section.
    pub fn xref_kind(&self) -> XrefKind {
        self.xref.kind()
    }

    /// Reference of the document catalog.
    pub fn catalog_ref(&self) -> ObjectRef {
        self.catalog_ref
    }

    /// The document catalog.
    pub fn catalog(&self) -> &Dict {
        &self.catalog
    }

    /// Pages in document order.
    pub fn pages(&self) -> &[PageNode] {
        &self.pages
    }

    /// Number of pages.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Visible (width, height) of every page, in order.
    pub fn page_sizes(&self) -> Vec<(f64, f64)> {
        self.pages.iter().map(|p| p.geometry.size()).collect()
    }

    /// Load an indirect object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ObjectNotFound`] for free or unknown objects, or a parse error when the
    /// object or its containing object stream is damaged.
    pub fn load_object(&self, obj_ref: ObjectRef) -> Result<Object> {
        match self.xref.get(obj_ref.id) {
            Some(XRefEntry::InUse { offset, .. }) => {
                let (found, object) = self.parse_at(*offset)?;
                if found.id != obj_ref.id {
                    return Err(Error::InvalidXref(format!(
                        "entry for {} points at object {}",
                        obj_ref, found
                    )));
                }
                Ok(object)
            },
            Some(XRefEntry::Compressed { stream, .. }) => {
                let objects = self.object_stream(*stream)?;
                objects
                    .get(&obj_ref.id)
                    .cloned()
                    .ok_or(Error::ObjectNotFound(obj_ref.id, obj_ref.gen))
            },
            _ => Err(Error::ObjectNotFound(obj_ref.id, obj_ref.gen)),
        }
    }

    /// Follow a reference, or clone a direct object.
    pub fn resolve(&self, obj: &Object) -> Result<Object> {
        match obj {
            Object::Reference(r) => self.load_object(*r),
            other => Ok(other.clone()),
        }
    }

    fn parse_at(&self, offset: u64) -> Result<(ObjectRef, Object)> {
        let start = usize::try_from(offset)
            .ok()
            .filter(|&o| o < self.raw.len())
            .ok_or(Error::UnexpectedEof)?;
        parse_indirect_object(&self.raw[start..])
            .map(|(_, parsed)| parsed)
            .map_err(|e| Error::ParseError {
                offset: start,
                reason: e.to_string(),
            })
    }

    fn object_stream(&self, number: u32) -> Result<Arc<HashMap<u32, Object>>> {
        if let Some(cached) = self.object_streams.lock().get(&number) {
            return Ok(Arc::clone(cached));
        }
        let offset = match self.xref.get(number) {
            Some(XRefEntry::InUse { offset, .. }) => *offset,
            _ => return Err(Error::ObjectNotFound(number, 0)),
        };
        let (_, stream) = self.parse_at(offset)?;
        let objects = Arc::new(parse_object_stream(&stream)?);
        self.object_streams.lock().insert(number, Arc::clone(&objects));
        Ok(objects)
    }

    fn collect_pages(&self) -> Result<Vec<PageNode>> {
        let root = self
            .catalog
            .get("Pages")
            .and_then(Object::as_reference)
            .ok_or_else(|| Error::InvalidPdf("catalog missing /Pages reference".to_string()))?;

        let mut pages = Vec::new();
        let mut visited = HashSet::new();
        self.walk_page_tree(root, Inherited::default(), &mut visited, &mut pages, 0)?;

        let declared = self
            .load_object(root)?
            .get("Count")
            .and_then(Object::as_integer)
            .unwrap_or(-1);
        if declared != pages.len() as i64 {
            log::warn!(
                "{}: page tree /Count is {} but {} page(s) were found",
                self.path.display(),
                declared,
                pages.len()
            );
        }
        Ok(pages)
    }

    fn walk_page_tree(
        &self,
        node_ref: ObjectRef,
        mut inherited: Inherited,
        visited: &mut HashSet<ObjectRef>,
        pages: &mut Vec<PageNode>,
        depth: u32,
    ) -> Result<()> {
        if depth >= MAX_RECURSION_DEPTH {
            return Err(Error::RecursionLimitExceeded(MAX_RECURSION_DEPTH));
        }
        if !visited.insert(node_ref) {
            return Err(Error::CircularReference(node_ref));
        }

        let node = self.load_object(node_ref)?;
        let dict = node.as_dict().ok_or_else(|| Error::InvalidObjectType {
            expected: "Dictionary".to_string(),
            found: node.type_name().to_string(),
        })?;
        inherited.absorb(self, dict)?;

        // Some producers omit /Type on leaves; a node without /Kids is a page
        let is_page = match dict.get("Type").and_then(Object::as_name) {
            Some("Page") => true,
            Some("Pages") => false,
            _ => !dict.contains_key("Kids"),
        };

        if is_page {
            pages.push(PageNode {
                reference: node_ref,
                dict: dict.clone(),
                geometry: inherited.geometry(),
            });
            return Ok(());
        }

        let kids = match dict.get("Kids") {
            Some(kids) => self.resolve(kids)?,
            None => return Err(Error::InvalidPdf(format!("pages node {} has no /Kids", node_ref))),
        };
        let kids = kids.as_array().ok_or_else(|| Error::InvalidObjectType {
            expected: "Array".to_string(),
            found: kids.type_name().to_string(),
        })?;
        for kid in kids {
            let kid_ref = kid
                .as_reference()
                .ok_or_else(|| Error::InvalidPdf("page tree kid is not a reference".to_string()))?;
            self.walk_page_tree(kid_ref, inherited.clone(), visited, pages, depth + 1)?;
        }
        Ok(())
    }
}

/// Inheritable page attributes (ISO 32000-1, Table 30) relevant to placement.
#[derive(Debug, Clone, Default)]
struct Inherited {
    media_box: Option<Rect>,
    crop_box: Option<Rect>,
    rotation: Option<i32>,
}

impl Inherited {
    fn absorb(&mut self, doc: &SourceDocument, dict: &Dict) -> Result<()> {
        if let Some(mb) = dict.get("MediaBox") {
            match Rect::from_pdf_array(&doc.resolve(mb)?) {
                Some(rect) => self.media_box = Some(rect),
                None => log::warn!("{}: ignoring malformed /MediaBox", doc.path.display()),
            }
        }
        if let Some(cb) = dict.get("CropBox") {
            if let Some(rect) = Rect::from_pdf_array(&doc.resolve(cb)?) {
                self.crop_box = Some(rect);
            }
        }
        if let Some(rotate) = dict.get("Rotate") {
            if let Some(r) = doc.resolve(rotate)?.as_integer() {
                self.rotation = Some((r.rem_euclid(360)) as i32);
            }
        }
        Ok(())
    }

    fn geometry(&self) -> PageGeometry {
        PageGeometry {
            media_box: self.media_box.unwrap_or(DEFAULT_MEDIA_BOX),
            crop_box: self.crop_box,
            rotation: self.rotation.unwrap_or(0),
        }
    }
}

/// Parse the `%PDF-M.m` header, which must start within the first 1024 bytes.
///
/// # Errors
///
/// Returns [`Error::InvalidHeader`] when the marker or version is missing.
pub fn parse_header(data: &[u8]) -> Result<(u8, u8)> {
    let window = &data[..data.len().min(1024)];
    let marker = b"%PDF-";
    let pos = window
        .windows(marker.len())
        .position(|w| w == marker)
        .ok_or_else(|| {
            Error::InvalidHeader(String::from_utf8_lossy(&data[..data.len().min(8)]).into_owned())
        })?;
    if pos > 0 {
        log::warn!("PDF header found at byte {} instead of 0", pos);
    }

    let version = &data[pos + marker.len()..];
    match version {
        [major @ b'1'..=b'2', b'.', minor, ..] if minor.is_ascii_digit() => {
            Ok((major - b'0', minor - b'0'))
        },
        _ => Err(Error::InvalidHeader(
            String::from_utf8_lossy(&data[pos..(pos + 8).min(data.len())]).into_owned(),
        )),
    }
}

/// Check that every uncompressed entry points at its own `id gen obj` header.
///
/// A corrupted table usually still parses; this is where it gets caught.
fn validate_xref_offsets(data: &[u8], xref: &CrossRefTable) -> Result<()> {
    for (number, entry) in xref.entries() {
        match entry {
            XRefEntry::InUse { offset, .. } => {
                if !object_header_at(data, *offset, number) {
                    return Err(Error::InvalidXref(format!(
                        "entry for object {} points at byte {} which is not its header",
                        number, offset
                    )));
                }
            },
            XRefEntry::Compressed { stream, .. } => {
                if !matches!(xref.get(*stream), Some(XRefEntry::InUse { .. })) {
                    return Err(Error::InvalidXref(format!(
                        "object {} lives in object stream {} which is not in use",
                        number, stream
                    )));
                }
            },
            XRefEntry::Free { .. } => {},
        }
    }
    Ok(())
}

fn object_header_at(data: &[u8], offset: u64, number: u32) -> bool {
    read_object_header(data, offset) == Some(i64::from(number))
}

fn read_object_header(data: &[u8], offset: u64) -> Option<i64> {
    let start = usize::try_from(offset).ok().filter(|&o| o < data.len())?;
    let (rest, id) = token(skip_ws(&data[start..])).ok()?;
    let (rest, generation) = token(rest).ok()?;
    let (_, keyword) = token(rest).ok()?;
    match (id, generation, keyword) {
        (Token::Integer(id), Token::Integer(_), Token::ObjStart) => Some(id),
        _ => None,
    }
}

/// Loads [`SourceDocument`]s from disk, mapping failures onto the batch taxonomy.
#[derive(Debug, Clone)]
pub struct DocumentLoader {
    read_retry_backoff: Duration,
}

impl Default for DocumentLoader {
    fn default() -> Self {
        Self {
            read_retry_backoff: Duration::from_millis(100),
        }
    }
}

impl DocumentLoader {
    /// Create a loader with the default 100ms retry backoff.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pause before the single read retry.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.read_retry_backoff = backoff;
        self
    }

    /// Read and parse a PDF.
    ///
    /// A failed read is retried once after the backoff, except when the file does not exist.
    ///
    /// # Errors
    ///
    /// [`SignError::UnreadableFile`] for I/O failures, [`SignError::MalformedDocument`] for
    /// anything that does not parse as a signable PDF.
    pub fn load(&self, path: &Path) -> std::result::Result<SourceDocument, SignError> {
        let raw = self.read_with_retry(path).map_err(|e| {
            SignError::UnreadableFile(format!("{}: {}", path.display(), e))
        })?;
        SourceDocument::from_bytes(path, raw).map_err(|e| {
            let reason = match e {
                Error::Encrypted => "encrypted documents are not supported".to_string(),
                other => other.to_string(),
            };
            SignError::MalformedDocument(format!("{}: {}", path.display(), reason))
        })
    }

    fn read_with_retry(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(e),
            Err(e) => {
                log::warn!(
                    "reading {} failed ({}), retrying in {:?}",
                    path.display(),
                    e,
                    self.read_retry_backoff
                );
                std::thread::sleep(self.read_retry_backoff);
                std::fs::read(path)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a classic PDF with the given page dictionaries (as written inside `obj`).
    fn build_pdf(pages: &[&str], pages_extra: &str, trailer_extra: &str) -> Vec<u8> {
        let mut pdf = b"%PDF-1.7\n".to_vec();
        let mut offsets = Vec::new();
        let kids: Vec<String> = (0..pages.len()).map(|i| format!("{} 0 R", i + 3)).collect();

        offsets.push(pdf.len());
        pdf.extend_from_slice(b"1 0 obj\n<< /Type /Catalog /Pages 2 0 R >>\nendobj\n");
        offsets.push(pdf.len());
        pdf.extend_from_slice(
            format!(
                "2 0 obj\n<< /Type /Pages /Kids [{}] /Count {} {} >>\nendobj\n",
                kids.join(" "),
                pages.len(),
                pages_extra
            )
            .as_bytes(),
        );
        for (i, page) in pages.iter().enumerate() {
            offsets.push(pdf.len());
            pdf.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", i + 3, page).as_bytes());
        }

        let xref = pdf.len();
        pdf.extend_from_slice(format!("xref\n0 {}\n0000000000 65535 f \n", offsets.len() + 1).as_bytes());
        for off in &offsets {
            pdf.extend_from_slice(format!("{:010} 00000 n \n", off).as_bytes());
        }
        pdf.extend_from_slice(
            format!(
                "trailer\n<< /Size {} /Root 1 0 R {} >>\nstartxref\n{}\n%%EOF\n",
                offsets.len() + 1,
                trailer_extra,
                xref
            )
            .as_bytes(),
        );
        pdf
    }

    #[test]
    fn test_parse_header_versions() {
        assert_eq!(parse_header(b"%PDF-1.7\n").unwrap(), (1, 7));
        assert_eq!(parse_header(b"junk\n%PDF-2.0\n").unwrap(), (2, 0));
        assert!(parse_header(b"%PS-Adobe").is_err());
        assert!(parse_header(b"%PDF-x.y").is_err());
    }

    #[test]
    fn test_inherited_media_box_and_crop_box() {
        let pdf = build_pdf(
            &[
                "<< /Type /Page /Parent 2 0 R >>",
                "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 842 595] /CropBox [10 10 832 585] /Rotate 90 >>",
            ],
            "/MediaBox [0 0 595 842]",
            "",
        );
        let doc = SourceDocument::from_bytes("mixed.pdf", pdf).unwrap();
        assert_eq!(doc.page_count(), 2);
        assert_eq!(doc.page_sizes(), vec![(595.0, 842.0), (822.0, 575.0)]);
        assert_eq!(doc.pages()[1].geometry.rotation, 90);
        assert_eq!(doc.pages()[1].geometry.display_size(), (575.0, 822.0));
        assert_eq!(doc.pages()[0].geometry.display_size(), (595.0, 842.0));
        assert_eq!(doc.pages()[0].reference, ObjectRef::new(3, 0));
        assert!(!doc.pages()[0].dict.contains_key("MediaBox"));
    }

    #[test]
    fn test_default_media_box() {
        let pdf = build_pdf(&["<< /Type /Page /Parent 2 0 R >>"], "", "");
        let doc = SourceDocument::from_bytes("letter.pdf", pdf).unwrap();
        assert_eq!(doc.page_sizes(), vec![(612.0, 792.0)]);
    }

    #[test]
    fn test_round_trip_is_identity() {
        let pdf = build_pdf(&["<< /Type /Page /Parent 2 0 R >>"], "", "");
        let doc = SourceDocument::from_bytes("a.pdf", pdf.clone()).unwrap();
        assert_eq!(&doc.to_bytes()[..], &pdf[..]);
    }

    #[test]
    fn test_encrypted_is_rejected() {
        let pdf = build_pdf(
            &["<< /Type /Page /Parent 2 0 R >>"],
            "",
            "/Encrypt << /Filter /Standard /V 2 >>",
        );
        let err = SourceDocument::from_bytes("enc.pdf", pdf).unwrap_err();
        assert!(matches!(err, Error::Encrypted));
    }

    #[test]
    fn test_wrong_entry_offset_is_rejected() {
        let pdf = build_pdf(&["<< /Type /Page /Parent 2 0 R >>"], "", "");
        let text = String::from_utf8(pdf).unwrap();
        let page_offset = text.find("3 0 obj").unwrap();
        let corrupted = text.replace(
            &format!("{:010} 00000 n", page_offset),
            &format!("{:010} 00000 n", page_offset + 4),
        );
        let err = SourceDocument::from_bytes("corrupt.pdf", corrupted).unwrap_err();
        assert!(matches!(err, Error::InvalidXref(_)));
    }

    #[test]
    fn test_page_tree_cycle_is_error() {
        let pdf = build_pdf(&["<< /Type /Pages /Kids [2 0 R] /Count 1 >>"], "", "");
        let err = SourceDocument::from_bytes("cycle.pdf", pdf).unwrap_err();
        assert!(matches!(err, Error::CircularReference(_)));
    }

    #[test]
    fn test_loader_maps_missing_file() {
        let err = DocumentLoader::new()
            .load(Path::new("/definitely/not/here.pdf"))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::SignErrorKind::UnreadableFile);
    }

    #[test]
    fn test_loader_retries_a_failed_read_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.pdf");
        // Reading a directory fails with something other than NotFound
        std::fs::create_dir(&path).unwrap();
        let pdf = build_pdf(&["<< /Type /Page /Parent 2 0 R >>"], "", "");
        let swap = {
            let path = path.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                std::fs::remove_dir(&path).unwrap();
                std::fs::write(&path, pdf).unwrap();
            })
        };

        let loader = DocumentLoader::new().with_retry_backoff(Duration::from_millis(500));
        let document = loader.load(&path).unwrap();
        swap.join().unwrap();
        assert_eq!(document.page_count(), 1);
    }

    #[test]
    fn test_loader_gives_up_after_one_retry() {
        let dir = tempfile::tempdir().unwrap();
        let err = DocumentLoader::new()
            .with_retry_backoff(Duration::from_millis(1))
            .load(dir.path())
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::SignErrorKind::UnreadableFile);
    }
}
