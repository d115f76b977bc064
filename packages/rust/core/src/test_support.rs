//! Helpers for tests that need real PDF bytes.

use std::path::Path;

use lopdf::{Dictionary, Document, Object, ObjectId, Stream, dictionary};

/// Build a PDF with one page per marker; each page shows its marker text.
///
/// `MediaBox` and `Resources` live on the `Pages` node, so merged pages only
/// render correctly if inherited attributes survive.
pub(crate) fn sample_pdf(markers: &[&str]) -> Vec<u8> {
    build_sample(markers, false)
}

/// Like [`sample_pdf`], with one top-level bookmark per page titled by its marker.
pub(crate) fn sample_pdf_with_outline(markers: &[&str]) -> Vec<u8> {
    build_sample(markers, true)
}

fn build_sample(markers: &[&str], with_outline: bool) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids = Vec::new();
    let mut page_ids = Vec::new();
    for marker in markers {
        let content = format!("BT /F1 24 Tf 72 720 Td ({marker}) Tj ET");
        let content_id = doc.add_object(Stream::new(Dictionary::new(), content.into_bytes()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(Object::Reference(page_id));
        page_ids.push(page_id);
    }

    let media_box = vec![
        Object::Integer(0),
        Object::Integer(0),
        Object::Integer(595),
        Object::Integer(842),
    ];
    let pages = dictionary! {
        "Type" => "Pages",
        "Kids" => kids,
        "Count" => markers.len() as i64,
        "Resources" => resources_id,
        "MediaBox" => media_box,
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages));

    let mut catalog = dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    };
    if with_outline && !page_ids.is_empty() {
        catalog.set("Outlines", add_outline(&mut doc, markers, &page_ids));
    }
    let catalog_id = doc.add_object(catalog);
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).expect("serialize sample pdf");
    bytes
}

/// One bookmark per page, chained under a fresh `Outlines` root.
fn add_outline(doc: &mut Document, markers: &[&str], page_ids: &[ObjectId]) -> ObjectId {
    let root_id = doc.new_object_id();
    let item_ids: Vec<ObjectId> = page_ids.iter().map(|_| doc.new_object_id()).collect();

    for (i, (&item_id, &page_id)) in item_ids.iter().zip(page_ids).enumerate() {
        let mut item = dictionary! {
            "Title" => Object::string_literal(markers[i]),
            "Parent" => root_id,
            "Dest" => vec![Object::Reference(page_id), Object::Name(b"Fit".to_vec())],
        };
        if i > 0 {
            item.set("Prev", item_ids[i - 1]);
        }
        if let Some(&next) = item_ids.get(i + 1) {
            item.set("Next", next);
        }
        doc.objects.insert(item_id, Object::Dictionary(item));
    }

    let root = dictionary! {
        "Type" => "Outlines",
        "First" => item_ids[0],
        "Last" => item_ids[item_ids.len() - 1],
        "Count" => item_ids.len() as i64,
    };
    doc.objects.insert(root_id, Object::Dictionary(root));
    root_id
}

/// Titles of the top-level bookmarks of the PDF at `path`, in order.
///
/// Panics if any item does not point back at the outline root.
pub(crate) fn outline_titles(path: &Path) -> Vec<String> {
    let doc = Document::load(path).expect("load merged pdf");
    let catalog_id = doc
        .trailer
        .get(b"Root")
        .and_then(Object::as_reference)
        .expect("catalog reference");
    let Ok(root_id) = doc
        .get_dictionary(catalog_id)
        .and_then(|catalog| catalog.get(b"Outlines"))
        .and_then(Object::as_reference)
    else {
        return Vec::new();
    };

    let root = doc.get_dictionary(root_id).expect("outline root");
    let mut titles = Vec::new();
    let mut next = root.get(b"First").and_then(Object::as_reference).ok();
    while let Some(id) = next {
        let item = doc.get_dictionary(id).expect("outline item");
        let parent = item.get(b"Parent").and_then(Object::as_reference);
        assert_eq!(parent.ok(), Some(root_id), "item {id:?} not under root");
        match item.get(b"Title") {
            Ok(Object::String(bytes, _)) => titles.push(String::from_utf8_lossy(bytes).into_owned()),
            other => panic!("item {id:?} has no title: {other:?}"),
        }
        next = item.get(b"Next").and_then(Object::as_reference).ok();
    }
    titles
}

/// Marker text of every page of the PDF at `path`, in page order.
pub(crate) fn page_markers(path: &Path) -> Vec<String> {
    let doc = Document::load(path).expect("load merged pdf");
    doc.get_pages()
        .into_values()
        .map(|page_id| {
            let content = doc.get_page_content(page_id).expect("page content");
            let text = String::from_utf8_lossy(&content);
            let start = text.find('(').expect("marker start") + 1;
            let end = text[start..].find(')').expect("marker end") + start;
            text[start..end].to_string()
        })
        .collect()
}
