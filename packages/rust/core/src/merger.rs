//! Combines staged PDF documents into one output document.
//!
//! Documents are appended in call order and their pages keep their original
//! order, so the combined file reads exactly like the input sequence.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use lopdf::{Document, Object, ObjectId, dictionary};
use tracing::{debug, info, instrument};

use crate::staging::StagingSlot;

/// PDF version written to the combined document.
const OUTPUT_PDF_VERSION: &str = "1.5";

/// Page attributes a page may inherit from its page-tree ancestors.
const INHERITABLE_KEYS: [&[u8]; 4] = [b"Resources", b"MediaBox", b"CropBox", b"Rotate"];

/// Guard against cyclic `Parent` chains in malformed files.
const MAX_TREE_DEPTH: usize = 64;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Why a document could not be merged or the result could not be written.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    /// The staged artifact is not a usable document.
    #[error("slot {index} ({path:?}) is not a usable PDF: {reason}")]
    Parse {
        index: usize,
        path: PathBuf,
        reason: String,
    },

    /// `finalize` was called before anything was appended.
    #[error("nothing has been merged")]
    Empty,

    /// The combined document could not be written.
    #[error("failed to write {path:?}: {reason}")]
    Write { path: PathBuf, reason: String },
}

/// Accumulates documents in order and writes them out as one.
///
/// A merger is used for exactly one run. `close` must be called once the
/// run is over, whatever its outcome; calling it again is a no-op.
pub trait DocumentMerger {
    /// Append the document stored in `slot` after everything merged so far.
    fn append(&mut self, slot: &StagingSlot) -> Result<(), MergeError>;

    /// True once at least one `append` has succeeded.
    fn has_content(&self) -> bool;

    /// Write the combined document to `output`.
    fn finalize(&mut self, output: &Path) -> Result<PathBuf, MergeError>;

    /// Drop all accumulated state.
    fn close(&mut self);
}

// ---------------------------------------------------------------------------
// PdfMerger
// ---------------------------------------------------------------------------

/// [`DocumentMerger`] for PDF files, built on `lopdf`.
///
/// Every appended document is renumbered past the objects already held, its
/// page tree and catalog are discarded, and its pages are re-parented under
/// one shared `Pages` node. Attributes the pages inherited from the discarded
/// tree are copied onto the pages themselves. Top-level bookmarks are kept
/// and chained, in document order, under one shared `Outlines` root.
pub struct PdfMerger {
    document: Document,
    pages_id: ObjectId,
    catalog_id: Option<ObjectId>,
    outline_id: Option<ObjectId>,
    kids: Vec<ObjectId>,
    bookmarks: Vec<ObjectId>,
    documents: usize,
}

impl PdfMerger {
    pub fn new() -> Self {
        let mut document = Document::with_version(OUTPUT_PDF_VERSION);
        let pages_id = document.new_object_id();
        Self {
            document,
            pages_id,
            catalog_id: None,
            outline_id: None,
            kids: Vec::new(),
            bookmarks: Vec::new(),
            documents: 0,
        }
    }

    /// Pages merged so far.
    pub fn page_count(&self) -> usize {
        self.kids.len()
    }

    /// Documents merged so far.
    pub fn document_count(&self) -> usize {
        self.documents
    }
}

impl Default for PdfMerger {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentMerger for PdfMerger {
    #[instrument(skip_all, fields(index = slot.index))]
    fn append(&mut self, slot: &StagingSlot) -> Result<(), MergeError> {
        let parse_err = |reason: String| MergeError::Parse {
            index: slot.index,
            path: slot.path.clone(),
            reason,
        };

        let mut source = Document::load(&slot.path).map_err(|e| parse_err(e.to_string()))?;
        source.renumber_objects_with(self.document.max_id + 1);

        let page_ids: Vec<ObjectId> = source.get_pages().into_values().collect();
        if page_ids.is_empty() {
            return Err(parse_err("document has no pages".into()));
        }

        let inherited: Vec<_> = page_ids
            .iter()
            .map(|&id| inherited_attributes(&source, id))
            .collect();

        let outline_root = outline_root(&source);
        let (top_bookmarks, reachable) = match outline_root {
            Some(root) => collect_outline(&source, root),
            None => (Vec::new(), HashSet::new()),
        };

        // Validate every page before touching the accumulated document, so a
        // rejected file leaves no stray objects behind.
        let mut objects = std::mem::take(&mut source.objects);
        let mut pages = Vec::with_capacity(page_ids.len());
        for (&page_id, attributes) in page_ids.iter().zip(inherited) {
            let mut page = match objects.remove(&page_id) {
                Some(Object::Dictionary(page)) => page,
                _ => return Err(parse_err(format!("page {page_id:?} is not a dictionary"))),
            };
            for (key, value) in attributes {
                if !page.has(&key) {
                    page.set(key, value);
                }
            }
            page.set("Parent", self.pages_id);
            pages.push((page_id, page));
        }

        let mut outline_roots: HashSet<ObjectId> = objects
            .iter()
            .filter(|(_, object)| matches!(type_name(object), Some(b"Outlines")))
            .map(|(id, _)| *id)
            .collect();
        outline_roots.extend(outline_root);

        // Bookmarks not reachable from the catalog would dangle once their
        // root is gone.
        let skipped: HashSet<ObjectId> = objects
            .iter()
            .filter(|(id, object)| {
                outline_roots.contains(*id)
                    || matches!(type_name(object), Some(b"Catalog" | b"Pages"))
                    || (!reachable.contains(*id)
                        && (matches!(type_name(object), Some(b"Outline"))
                            || parent_of(object).is_some_and(|p| outline_roots.contains(&p))))
            })
            .map(|(id, _)| *id)
            .collect();

        for (id, object) in objects {
            if !skipped.contains(&id) {
                self.document.objects.insert(id, object);
            }
        }
        for (id, page) in pages {
            self.document.objects.insert(id, Object::Dictionary(page));
            self.kids.push(id);
        }

        self.document.max_id = self.document.max_id.max(source.max_id);
        self.bookmarks.extend(top_bookmarks);
        self.documents += 1;

        debug!(
            pages = page_ids.len(),
            bookmarks = self.bookmarks.len(),
            total_pages = self.kids.len(),
            "document appended"
        );

        Ok(())
    }

    fn has_content(&self) -> bool {
        !self.kids.is_empty()
    }

    #[instrument(skip_all, fields(output = %output.display()))]
    fn finalize(&mut self, output: &Path) -> Result<PathBuf, MergeError> {
        if self.kids.is_empty() {
            return Err(MergeError::Empty);
        }

        let write_err = |reason: String| MergeError::Write {
            path: output.to_path_buf(),
            reason,
        };

        let Some(file_name) = output.file_name() else {
            return Err(write_err("output path has no file name".into()));
        };
        let temp = output.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| write_err(e.to_string()))?;
        }

        let kids: Vec<Object> = self.kids.iter().map(|&id| Object::Reference(id)).collect();
        let pages = dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => self.kids.len() as i64,
        };
        self.document
            .objects
            .insert(self.pages_id, Object::Dictionary(pages));

        let outline_id = self.link_bookmarks();
        let catalog_id = *self
            .catalog_id
            .get_or_insert_with(|| self.document.new_object_id());
        let mut catalog = dictionary! {
            "Type" => "Catalog",
            "Pages" => self.pages_id,
        };
        if let Some(id) = outline_id {
            catalog.set("Outlines", id);
        }
        self.document
            .objects
            .insert(catalog_id, Object::Dictionary(catalog));
        self.document.trailer.set("Root", catalog_id);

        // Write next to the output and rename into place, so a failed write
        // never leaves a truncated file at `output`.
        let written = self
            .document
            .save(&temp)
            .map(drop)
            .map_err(|e| write_err(e.to_string()))
            .and_then(|()| std::fs::rename(&temp, output).map_err(|e| write_err(e.to_string())));
        if let Err(e) = written {
            if let Err(cleanup) = std::fs::remove_file(&temp) {
                debug!(path = %temp.display(), error = %cleanup, "no temporary output to remove");
            }
            return Err(e);
        }

        info!(
            documents = self.documents,
            pages = self.kids.len(),
            bookmarks = self.bookmarks.len(),
            "combined document written"
        );

        Ok(output.to_path_buf())
    }

    fn close(&mut self) {
        if self.documents == 0 && self.kids.is_empty() && self.catalog_id.is_none() {
            return;
        }
        *self = Self::new();
        debug!("merger closed");
    }
}

impl PdfMerger {
    /// Chain every document's top-level bookmarks under one shared root.
    fn link_bookmarks(&mut self) -> Option<ObjectId> {
        let (&first, &last) = (self.bookmarks.first()?, self.bookmarks.last()?);
        let root_id = *self
            .outline_id
            .get_or_insert_with(|| self.document.new_object_id());

        let items = &self.bookmarks;
        for (i, &id) in items.iter().enumerate() {
            let Ok(item) = self
                .document
                .get_object_mut(id)
                .and_then(Object::as_dict_mut)
            else {
                continue;
            };
            item.set("Parent", root_id);
            match i.checked_sub(1).map(|prev| items[prev]) {
                Some(prev) => item.set("Prev", prev),
                None => {
                    item.remove(b"Prev");
                }
            }
            match items.get(i + 1) {
                Some(&next) => item.set("Next", next),
                None => {
                    item.remove(b"Next");
                }
            }
        }

        let root = dictionary! {
            "Type" => "Outlines",
            "First" => first,
            "Last" => last,
            "Count" => items.len() as i64,
        };
        self.document
            .objects
            .insert(root_id, Object::Dictionary(root));
        Some(root_id)
    }
}

/// The `/Type` name of a dictionary object, if it has one.
fn type_name(object: &Object) -> Option<&[u8]> {
    match object {
        Object::Dictionary(dict) => dict.get(b"Type").and_then(Object::as_name).ok(),
        _ => None,
    }
}

/// The `/Parent` reference of a dictionary object, if it has one.
fn parent_of(object: &Object) -> Option<ObjectId> {
    match object {
        Object::Dictionary(dict) => dict.get(b"Parent").and_then(Object::as_reference).ok(),
        _ => None,
    }
}

/// The outline root the document catalog points at.
fn outline_root(doc: &Document) -> Option<ObjectId> {
    let catalog_id = doc.trailer.get(b"Root").and_then(Object::as_reference).ok()?;
    doc.get_dictionary(catalog_id)
        .ok()?
        .get(b"Outlines")
        .and_then(Object::as_reference)
        .ok()
}

/// Children of an outline node, following its `First`/`Next` chain.
fn outline_children(doc: &Document, node: ObjectId, seen: &mut HashSet<ObjectId>) -> Vec<ObjectId> {
    let mut children = Vec::new();
    let mut next = doc
        .get_dictionary(node)
        .and_then(|dict| dict.get(b"First"))
        .and_then(Object::as_reference)
        .ok();

    while let Some(id) = next {
        if !seen.insert(id) {
            break;
        }
        let Ok(item) = doc.get_dictionary(id) else {
            break;
        };
        children.push(id);
        next = item.get(b"Next").and_then(Object::as_reference).ok();
    }
    children
}

/// Top-level bookmarks under `root`, and every bookmark reachable from it.
fn collect_outline(doc: &Document, root: ObjectId) -> (Vec<ObjectId>, HashSet<ObjectId>) {
    let mut seen = HashSet::from([root]);
    let top = outline_children(doc, root, &mut seen);
    let mut pending = top.clone();
    while let Some(id) = pending.pop() {
        pending.extend(outline_children(doc, id, &mut seen));
    }
    (top, seen)
}

/// Collect the inheritable attributes `page_id` lacks but an ancestor defines.
fn inherited_attributes(doc: &Document, page_id: ObjectId) -> Vec<(Vec<u8>, Object)> {
    let mut found = Vec::new();
    let Ok(page) = doc.get_dictionary(page_id) else {
        return found;
    };

    let mut missing: Vec<&[u8]> = INHERITABLE_KEYS
        .iter()
        .copied()
        .filter(|key| !page.has(key))
        .collect();
    let mut parent = page.get(b"Parent").and_then(Object::as_reference).ok();
    let mut depth = 0;

    while let Some(parent_id) = parent {
        if missing.is_empty() || depth >= MAX_TREE_DEPTH {
            break;
        }
        let Ok(node) = doc.get_dictionary(parent_id) else {
            break;
        };

        missing.retain(|key| match node.get(key) {
            Ok(value) => {
                found.push((key.to_vec(), value.clone()));
                false
            }
            Err(_) => true,
        });

        parent = node.get(b"Parent").and_then(Object::as_reference).ok();
        depth += 1;
    }

    found
}
