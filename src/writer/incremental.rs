//! Incremental updates.
//!
//! An incremental update appends changed and new objects after the original `%%EOF`, followed by
//! a cross-reference section that covers only those objects and points back at the previous
//! section through `/Prev`. The original bytes are never touched, so earlier signatures and
//! every unrelated object stay valid.

use super::object_serializer::ObjectSerializer;
use crate::document::SourceDocument;
use crate::error::{Error, Result};
use crate::object::{Dict, Object, ObjectRef};
use crate::xref::XrefKind;
use flate2::Compression;
use flate2::write::ZlibEncoder;
use std::collections::BTreeMap;
use std::io::Write;

/// Trailer keys carried over from the previous section.
const CARRIED_TRAILER_KEYS: [&str; 3] = ["Root", "Info", "ID"];

/// Bytes of an update together with where each object landed.
#[derive(Debug, Clone)]
pub struct UpdateLayout {
    /// The complete file: original bytes followed by the update
    pub bytes: Vec<u8>,
    /// Absolute offset of each written object
    pub offsets: BTreeMap<ObjectRef, usize>,
    /// Offset of the new cross-reference section
    pub startxref: usize,
}

impl UpdateLayout {
    /// Offset of an object written by this update.
    pub fn offset_of(&self, obj_ref: ObjectRef) -> Option<usize> {
        self.offsets.get(&obj_ref).copied()
    }
}

/// Collects objects for one incremental update of a [`SourceDocument`].
#[derive(Debug)]
pub struct IncrementalUpdate<'a> {
    document: &'a SourceDocument,
    objects: BTreeMap<ObjectRef, Object>,
    next_id: u32,
    serializer: ObjectSerializer,
}

impl<'a> IncrementalUpdate<'a> {
    /// Start an update. New objects are numbered from the document's `/Size`.
    pub fn new(document: &'a SourceDocument) -> Self {
        Self {
            document,
            objects: BTreeMap::new(),
            next_id: document.xref().size().max(1),
            serializer: ObjectSerializer::new(),
        }
    }

    /// Reserve a fresh object number.
    pub fn allocate(&mut self) -> ObjectRef {
        let obj_ref = ObjectRef::new(self.next_id, 0);
        self.next_id += 1;
        obj_ref
    }

    /// Add a new object, or replace an existing one under its current number.
    pub fn put(&mut self, obj_ref: ObjectRef, object: Object) {
        self.objects.insert(obj_ref, object);
    }

    /// Object queued under `obj_ref`, if any.
    pub fn get(&self, obj_ref: ObjectRef) -> Option<&Object> {
        self.objects.get(&obj_ref)
    }

    /// Number of queued objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether nothing has been queued.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Lay out the update after the original bytes.
    ///
    /// The cross-reference section uses the same format as the document's latest section.
    ///
    /// # Errors
    ///
    /// Fails when there is nothing to write or an object does not serialize.
    pub fn write(mut self) -> Result<UpdateLayout> {
        if self.objects.is_empty() {
            return Err(Error::InvalidArgument("incremental update has no objects".to_string()));
        }

        let original = self.document.raw_bytes();
        let mut bytes = Vec::with_capacity(original.len() + 32 * 1024);
        bytes.extend_from_slice(original);
        if !matches!(bytes.last(), Some(b'\n') | Some(b'\r')) {
            bytes.push(b'\n');
        }

        let mut offsets = BTreeMap::new();
        for (obj_ref, object) in &self.objects {
            offsets.insert(*obj_ref, bytes.len());
            bytes.extend_from_slice(&self.serializer.serialize_indirect(*obj_ref, object)?);
        }

        let startxref = bytes.len();
        match self.document.xref_kind() {
            XrefKind::Table => self.write_table(&mut bytes, &offsets)?,
            XrefKind::Stream => {
                let stream_ref = self.allocate();
                offsets.insert(stream_ref, startxref);
                self.write_stream(&mut bytes, stream_ref, &offsets)?;
            },
        }
        write!(bytes, "startxref\n{}\n%%EOF\n", startxref)?;

        log::debug!(
            "incremental update of {}: {} object(s), {:?} xref at {}",
            self.document.path().display(),
            offsets.len(),
            self.document.xref_kind(),
            startxref
        );

        Ok(UpdateLayout {
            bytes,
            offsets,
            startxref,
        })
    }

    fn trailer(&self) -> Dict {
        let mut trailer = Dict::new();
        for key in CARRIED_TRAILER_KEYS {
            if let Some(value) = self.document.trailer().get(key) {
                trailer.insert(key.to_string(), value.clone());
            }
        }
        trailer.insert("Root".to_string(), self.document.catalog_ref().into());
        trailer.insert("Size".to_string(), Object::Integer(i64::from(self.next_id)));
        trailer.insert(
            "Prev".to_string(),
            Object::Integer(self.document.xref().startxref() as i64),
        );
        trailer
    }

    fn write_table(&self, out: &mut Vec<u8>, offsets: &BTreeMap<ObjectRef, usize>) -> Result<()> {
        out.extend_from_slice(b"xref\n");
        for run in subsections(offsets) {
            writeln!(out, "{} {}", run[0].0.id, run.len())?;
            for (obj_ref, offset) in run {
                // Each entry is exactly 20 bytes
                write!(out, "{:010} {:05} n \n", offset, obj_ref.gen)?;
            }
        }
        out.extend_from_slice(b"trailer\n");
        self.serializer.write_object(out, &Object::Dictionary(self.trailer()))?;
        out.push(b'\n');
        Ok(())
    }

    fn write_stream(
        &self,
        out: &mut Vec<u8>,
        stream_ref: ObjectRef,
        offsets: &BTreeMap<ObjectRef, usize>,
    ) -> Result<()> {
        let max_offset = offsets.values().copied().max().unwrap_or(0);
        let offset_width = byte_width(max_offset as u64);

        let mut rows = Vec::new();
        let mut index = Vec::new();
        for run in subsections(offsets) {
            index.push(Object::Integer(i64::from(run[0].0.id)));
            index.push(Object::Integer(run.len() as i64));
            for (obj_ref, offset) in run {
                rows.push(1u8);
                rows.extend_from_slice(&(offset as u64).to_be_bytes()[8 - offset_width..]);
                rows.extend_from_slice(&obj_ref.gen.to_be_bytes());
            }
        }

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&rows)?;
        let data = encoder.finish()?;

        let mut dict = self.trailer();
        dict.insert("Type".to_string(), Object::name("XRef"));
        dict.insert("Filter".to_string(), Object::name("FlateDecode"));
        dict.insert("Index".to_string(), Object::Array(index));
        dict.insert(
            "W".to_string(),
            Object::Array(vec![
                Object::Integer(1),
                Object::Integer(offset_width as i64),
                Object::Integer(2),
            ]),
        );
        let stream = Object::Stream {
            dict,
            data: data.into(),
        };
        out.extend_from_slice(&self.serializer.serialize_indirect(stream_ref, &stream)?);
        Ok(())
    }
}

/// Group entries into runs of consecutive object numbers.
fn subsections(offsets: &BTreeMap<ObjectRef, usize>) -> Vec<Vec<(ObjectRef, usize)>> {
    let mut runs: Vec<Vec<(ObjectRef, usize)>> = Vec::new();
    for (obj_ref, offset) in offsets {
        match runs.last_mut() {
            Some(run) if run.last().map(|(r, _)| r.id + 1) == Some(obj_ref.id) => {
                run.push((*obj_ref, *offset));
            },
            _ => runs.push(vec![(*obj_ref, *offset)]),
        }
    }
    runs
}

/// Bytes needed to hold `value`, at least one.
fn byte_width(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(8).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xref::{XRefEntry, find_startxref, parse_xref};

    fn classic_pdf() -> Vec<u8> {
        let mut pdf = b"%PDF-1.4\n".to_vec();
        let catalog = pdf.len();
        pdf.extend_from_slice(b"1 0 obj\n<< /Type /Catalog /Pages 2 0 R >>\nendobj\n");
        let pages = pdf.len();
        pdf.extend_from_slice(b"2 0 obj\n<< /Type /Pages /Kids [3 0 R] /Count 1 >>\nendobj\n");
        let page = pdf.len();
        pdf.extend_from_slice(b"3 0 obj\n<< /Type /Page /Parent 2 0 R >>\nendobj\n");
        let xref = pdf.len();
        pdf.extend_from_slice(
            format!(
                "xref\n0 4\n0000000000 65535 f \n{:010} 00000 n \n{:010} 00000 n \n{:010} 00000 n \ntrailer\n<< /Size 4 /Root 1 0 R /ID [<AA> <BB>] >>\nstartxref\n{}\n%%EOF",
                catalog, pages, page, xref
            )
            .as_bytes(),
        );
        pdf
    }

    #[test]
    fn test_subsections_group_consecutive_numbers() {
        let mut offsets = BTreeMap::new();
        offsets.insert(ObjectRef::new(3, 0), 10);
        offsets.insert(ObjectRef::new(4, 0), 20);
        offsets.insert(ObjectRef::new(9, 0), 30);
        let runs = subsections(&offsets);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].len(), 2);
        assert_eq!(runs[1][0].0.id, 9);
    }

    #[test]
    fn test_byte_width() {
        assert_eq!(byte_width(0), 1);
        assert_eq!(byte_width(255), 1);
        assert_eq!(byte_width(256), 2);
        assert_eq!(byte_width(70_000), 3);
    }

    #[test]
    fn test_empty_update_is_error() {
        let doc = SourceDocument::from_bytes("a.pdf", classic_pdf()).unwrap();
        assert!(IncrementalUpdate::new(&doc).write().is_err());
    }

    #[test]
    fn test_classic_update_chains_to_previous_section() {
        let original = classic_pdf();
        let doc = SourceDocument::from_bytes("a.pdf", original.clone()).unwrap();

        let mut update = IncrementalUpdate::new(&doc);
        let new_ref = update.allocate();
        assert_eq!(new_ref, ObjectRef::new(4, 0));
        update.put(new_ref, Object::Integer(42));
        let mut page = doc.pages()[0].dict.clone();
        page.insert("Annots".to_string(), Object::Array(vec![new_ref.into()]));
        update.put(ObjectRef::new(3, 0), Object::Dictionary(page));
        let layout = update.write().unwrap();

        assert!(layout.bytes.starts_with(&original));
        assert_eq!(layout.bytes[original.len()], b'\n');

        let reparsed = SourceDocument::from_bytes("a.pdf", layout.bytes.clone()).unwrap();
        assert_eq!(reparsed.xref().section_count(), 2);
        assert_eq!(reparsed.load_object(new_ref).unwrap(), Object::Integer(42));
        assert!(reparsed.pages()[0].dict.contains_key("Annots"));
        assert_eq!(reparsed.trailer().get("Size").and_then(Object::as_integer), Some(5));
        assert!(reparsed.trailer().contains_key("ID"));
        assert_eq!(
            reparsed.xref().get(3),
            Some(&XRefEntry::InUse {
                offset: layout.offset_of(ObjectRef::new(3, 0)).unwrap() as u64,
                generation: 0
            })
        );
    }

    #[test]
    fn test_stream_update_for_stream_documents() {
        // Turn the classic fixture into one whose latest section is an xref stream
        let original = classic_pdf();
        let doc = SourceDocument::from_bytes("a.pdf", original).unwrap();
        let mut first = IncrementalUpdate::new(&doc);
        let r = first.allocate();
        first.put(r, Object::Integer(1));
        let layout = first.write().unwrap();
        let mut patched = layout.bytes.clone();
        let xref_at = find_startxref(&patched).unwrap() as usize;
        patched.truncate(xref_at);
        let table = parse_xref(&layout.bytes, xref_at as u64).unwrap();

        // Rewrite the latest section as a stream by hand
        let stream_id = table.size();
        let offset = layout.offset_of(r).unwrap();
        let rows: Vec<u8> = [vec![1u8], (offset as u32).to_be_bytes().to_vec(), vec![0, 0]].concat();
        let stream_rows: Vec<u8> = [vec![1u8], (xref_at as u32).to_be_bytes().to_vec(), vec![0, 0]].concat();
        let data = [rows, stream_rows].concat();
        patched.extend_from_slice(
            format!(
                "{} 0 obj\n<< /Type /XRef /Size {} /Index [{} 2] /W [1 4 2] /Root 1 0 R /Prev {} /Length {} >>\nstream\n",
                stream_id,
                stream_id + 1,
                r.id,
                doc.xref().startxref(),
                data.len()
            )
            .as_bytes(),
        );
        patched.extend_from_slice(&data);
        patched.extend_from_slice(format!("\nendstream\nendobj\nstartxref\n{}\n%%EOF\n", xref_at).as_bytes());

        let stream_doc = SourceDocument::from_bytes("s.pdf", patched.clone()).unwrap();
        assert_eq!(stream_doc.xref_kind(), XrefKind::Stream);

        let mut update = IncrementalUpdate::new(&stream_doc);
        let added = update.allocate();
        update.put(added, Object::name("Hello"));
        let layout = update.write().unwrap();
        assert!(layout.bytes.starts_with(&patched));

        let reparsed = SourceDocument::from_bytes("s.pdf", layout.bytes).unwrap();
        assert_eq!(reparsed.xref_kind(), XrefKind::Stream);
        assert_eq!(reparsed.xref().section_count(), 3);
        assert_eq!(reparsed.load_object(added).unwrap(), Object::name("Hello"));
        assert_eq!(reparsed.load_object(r).unwrap(), Object::Integer(1));
    }
}
