//! files.xml serialization.
//!
//! The ADC standard list format: a `<FileListing>` root containing
//! `<Directory Name="...">` and `<File Name="..." Size="..."
//! TTH="..."/>` elements, optionally bzip2-compressed. The reader is
//! tolerant where the format allows (unknown elements and attributes are
//! ignored, stray text skipped) and strict where the data model demands
//! it (names, sizes, hashes, nesting depth).

use crate::tree::{FileList, NodeId, TreeError};
use crate::{MAX_XML_DEPTH, XmlError};
use driftdc_tth::Root;
use quick_xml::Reader;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

/// Read a file list from raw bytes.
///
/// # Errors
///
/// [`XmlError`] on I/O, malformed XML, rejected constructs (CDATA,
/// processing instructions, DTD), over-deep nesting, or contract
/// violations (bad names, sizes, hashes).
pub fn read_filelist(bytes: &[u8], compressed: bool) -> Result<FileList, XmlError> {
    if compressed {
        let mut decoder = bzip2::read::BzDecoder::new(bytes);
        let mut plain = Vec::new();
        decoder.read_to_end(&mut plain)?;
        parse(BufReader::new(plain.as_slice()))
    } else {
        parse(BufReader::new(bytes))
    }
}

/// Load a file list from disk, detecting compression by the `.bz2`
/// suffix.
///
/// # Errors
///
/// As [`read_filelist`].
pub fn load_filelist(path: &Path) -> Result<FileList, XmlError> {
    let bytes = std::fs::read(path)?;
    let compressed = path.extension().is_some_and(|e| e == "bz2");
    read_filelist(&bytes, compressed)
}

fn attr_string(e: &BytesStart<'_>, name: &str) -> Option<String> {
    for attr in e.attributes().with_checks(false).flatten() {
        if attr.key.as_ref() == name.as_bytes() {
            // Prefer proper unescaping; fall back to identity
            // transcoding for lists from clients with broken charsets.
            return Some(match attr.unescape_value() {
                Ok(v) => v.into_owned(),
                Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
            });
        }
    }
    None
}

fn parse<R: BufRead>(input: R) -> Result<FileList, XmlError> {
    let mut reader = Reader::from_reader(input);
    reader.trim_text(true);

    let mut list = FileList::new();
    let mut buf = Vec::new();
    let mut saw_root = false;
    let mut dir_stack: Vec<NodeId> = Vec::new();
    // Depth of an unknown subtree currently being skipped.
    let mut skip_depth = 0usize;
    let mut depth = 0usize;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| XmlError::Parse(e.to_string()))?;
        match event {
            Event::Decl(_) | Event::Comment(_) | Event::Text(_) => {}
            Event::CData(_) => return Err(XmlError::Invalid("CDATA not allowed")),
            Event::PI(_) => return Err(XmlError::Invalid("processing instruction not allowed")),
            Event::DocType(_) => return Err(XmlError::Invalid("DTD not allowed")),
            Event::Start(e) => {
                depth += 1;
                if depth > MAX_XML_DEPTH {
                    return Err(XmlError::Invalid("nesting too deep"));
                }
                if skip_depth > 0 {
                    skip_depth += 1;
                    continue;
                }
                match e.name().as_ref() {
                    b"FileListing" if !saw_root => {
                        saw_root = true;
                        dir_stack.push(list.root());
                    }
                    b"FileListing" => return Err(XmlError::Invalid("nested FileListing")),
                    b"Directory" if saw_root => {
                        let dir = *dir_stack
                            .last()
                            .ok_or(XmlError::Invalid("element outside FileListing"))?;
                        match open_directory(&mut list, dir, &e)? {
                            Some(id) => dir_stack.push(id),
                            // Case-duplicate: keep parsing, drop subtree.
                            None => skip_depth = 1,
                        }
                    }
                    b"File" if saw_root => {
                        let dir = *dir_stack
                            .last()
                            .ok_or(XmlError::Invalid("element outside FileListing"))?;
                        add_file(&mut list, dir, &e)?;
                        // A <File> with children is not meaningful; skip
                        // whatever is inside.
                        skip_depth = 1;
                    }
                    _ => skip_depth = 1,
                }
            }
            Event::Empty(e) => {
                if skip_depth > 0 {
                    continue;
                }
                match e.name().as_ref() {
                    b"File" if saw_root => {
                        let dir = *dir_stack
                            .last()
                            .ok_or(XmlError::Invalid("element outside FileListing"))?;
                        add_file(&mut list, dir, &e)?;
                    }
                    b"Directory" if saw_root => {
                        let dir = *dir_stack
                            .last()
                            .ok_or(XmlError::Invalid("element outside FileListing"))?;
                        let _ = open_directory(&mut list, dir, &e)?;
                    }
                    _ => {}
                }
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                if skip_depth > 0 {
                    skip_depth -= 1;
                } else {
                    dir_stack.pop();
                }
            }
            Event::Eof => break,
        }
        buf.clear();
    }

    if !saw_root {
        return Err(XmlError::Invalid("missing FileListing root"));
    }
    Ok(list)
}

fn open_directory(
    list: &mut FileList,
    parent: NodeId,
    e: &BytesStart<'_>,
) -> Result<Option<NodeId>, XmlError> {
    let name = attr_string(e, "Name").ok_or(XmlError::Invalid("Directory without Name"))?;
    match list.add_dir(parent, &name) {
        Ok(id) => Ok(Some(id)),
        Err(TreeError::Duplicate) => {
            tracing::warn!(name, "duplicate directory in file list, skipping");
            Ok(None)
        }
        Err(_) => Err(XmlError::Invalid("invalid directory name")),
    }
}

fn add_file(list: &mut FileList, dir: NodeId, e: &BytesStart<'_>) -> Result<(), XmlError> {
    let name = attr_string(e, "Name").ok_or(XmlError::Invalid("File without Name"))?;
    let size: u64 = attr_string(e, "Size")
        .and_then(|s| s.parse().ok())
        .ok_or(XmlError::Invalid("File without a valid Size"))?;
    let tth = attr_string(e, "TTH")
        .and_then(|s| Root::from_base32(&s).ok())
        .ok_or(XmlError::Invalid("File without a valid TTH"))?;
    match list.add_file(dir, &name, size, tth, None) {
        Ok(_) => Ok(()),
        Err(TreeError::Duplicate) => {
            tracing::warn!(name, "duplicate file in file list, skipping");
            Ok(())
        }
        Err(_) => Err(XmlError::Invalid("invalid file name")),
    }
}

/// Serialize a file list to bytes, optionally bzip2-compressed.
///
/// # Errors
///
/// [`XmlError::Io`] on writer failure.
pub fn write_filelist(list: &FileList, compressed: bool) -> Result<Vec<u8>, XmlError> {
    let mut plain = Vec::new();
    serialize(list, &mut plain)?;
    if !compressed {
        return Ok(plain);
    }
    let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
    encoder.write_all(&plain)?;
    Ok(encoder.finish()?)
}

/// Serialize and write to disk; compression follows the `.bz2` suffix.
///
/// # Errors
///
/// As [`write_filelist`].
pub fn save_filelist(list: &FileList, path: &Path) -> Result<(), XmlError> {
    let compressed = path.extension().is_some_and(|e| e == "bz2");
    let bytes = write_filelist(list, compressed)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

fn serialize(list: &FileList, out: &mut Vec<u8>) -> Result<(), XmlError> {
    let mut writer = quick_xml::Writer::new_with_indent(out, b'\t', 1);
    // Writing to a Vec cannot fail at the I/O layer; any error here is a
    // serialization defect.
    let io_err = |e: quick_xml::Error| XmlError::Parse(e.to_string());

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(io_err)?;
    let mut root = BytesStart::new("FileListing");
    root.push_attribute(("Version", "1"));
    root.push_attribute(("Base", "/"));
    root.push_attribute((
        "Generator",
        concat!("driftdc ", env!("CARGO_PKG_VERSION")),
    ));
    writer.write_event(Event::Start(root)).map_err(io_err)?;
    write_dir(list, list.root(), &mut writer).map_err(io_err)?;
    writer
        .write_event(Event::End(BytesEnd::new("FileListing")))
        .map_err(io_err)?;
    Ok(())
}

fn write_dir(
    list: &FileList,
    dir: NodeId,
    writer: &mut quick_xml::Writer<&mut Vec<u8>>,
) -> Result<(), quick_xml::Error> {
    for &child in list.children(dir) {
        if list.is_dir(child) {
            let mut e = BytesStart::new("Directory");
            e.push_attribute(("Name", list.name(child)));
            if list.children(child).is_empty() {
                writer.write_event(Event::Empty(e))?;
            } else {
                writer.write_event(Event::Start(e))?;
                write_dir(list, child, writer)?;
                writer.write_event(Event::End(BytesEnd::new("Directory")))?;
            }
        } else {
            let mut e = BytesStart::new("File");
            e.push_attribute(("Name", list.name(child)));
            e.push_attribute(("Size", list.size(child).to_string().as_str()));
            let tth = list.tth(child).unwrap_or(Root::ZERO);
            e.push_attribute(("TTH", tth.to_base32().as_str()));
            writer.write_event(Event::Empty(e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zero_root() -> Root {
        Root::ZERO
    }

    #[test]
    fn roundtrip_single_dir_and_file() {
        let mut fl = FileList::new();
        let a = fl.add_dir(fl.root(), "A").unwrap();
        fl.add_file(a, "f", 5, zero_root(), None).unwrap();

        let bytes = write_filelist(&fl, false).unwrap();
        let back = read_filelist(&bytes, false).unwrap();
        assert!(fl.structural_eq(&back));
    }

    #[test]
    fn roundtrip_bzip2() {
        let mut fl = FileList::new();
        fl.add_file(fl.root(), "big", 1 << 30, zero_root(), None)
            .unwrap();
        let bytes = write_filelist(&fl, true).unwrap();
        // bzip2 magic.
        assert_eq!(&bytes[..3], b"BZh");
        let back = read_filelist(&bytes, true).unwrap();
        assert!(fl.structural_eq(&back));
    }

    #[test]
    fn parses_entities_in_names() {
        let xml = br#"<?xml version="1.0"?><FileListing Version="1">
            <File Name="a&amp;b &#60;c&#62;" Size="1" TTH="AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"/>
        </FileListing>"#;
        let fl = read_filelist(xml, false).unwrap();
        assert!(fl.child(fl.root(), "a&b <c>").is_some());
    }

    #[test]
    fn ignores_unknown_elements_and_attributes() {
        let xml = br#"<FileListing Version="1" CID="xyz">
            <Something><Nested/></Something>
            <Directory Name="D" Extra="1">
                <File Name="f" Size="2" TTH="AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA" Junk="y"/>
            </Directory>
        </FileListing>"#;
        let fl = read_filelist(xml, false).unwrap();
        let d = fl.child(fl.root(), "D").unwrap();
        assert_eq!(fl.size(d), 2);
    }

    #[test]
    fn rejects_cdata_pi_dtd() {
        let cdata = b"<FileListing><![CDATA[x]]></FileListing>";
        assert!(matches!(
            read_filelist(cdata, false),
            Err(XmlError::Invalid(_))
        ));
        let pi = b"<FileListing><?php ?></FileListing>";
        assert!(matches!(read_filelist(pi, false), Err(XmlError::Invalid(_))));
        let dtd = b"<!DOCTYPE foo><FileListing/>";
        assert!(matches!(read_filelist(dtd, false), Err(XmlError::Invalid(_))));
    }

    #[test]
    fn rejects_deep_nesting() {
        let mut xml = String::from("<FileListing>");
        for i in 0..60 {
            xml.push_str(&format!("<Directory Name=\"d{i}\">"));
        }
        for _ in 0..60 {
            xml.push_str("</Directory>");
        }
        xml.push_str("</FileListing>");
        assert!(matches!(
            read_filelist(xml.as_bytes(), false),
            Err(XmlError::Invalid("nesting too deep"))
        ));
    }

    #[test]
    fn rejects_bad_size_and_tth() {
        let bad_size = br#"<FileListing><File Name="f" Size="-1" TTH="AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"/></FileListing>"#;
        assert!(read_filelist(bad_size, false).is_err());
        let bad_tth =
            br#"<FileListing><File Name="f" Size="1" TTH="SHORT"/></FileListing>"#;
        assert!(read_filelist(bad_tth, false).is_err());
    }

    #[test]
    fn rejects_reserved_names() {
        let dotdot = br#"<FileListing><Directory Name=".."/></FileListing>"#;
        assert!(read_filelist(dotdot, false).is_err());
    }

    #[test]
    fn skips_case_duplicates() {
        let xml = br#"<FileListing>
            <Directory Name="A"><File Name="f" Size="1" TTH="AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"/></Directory>
            <Directory Name="a"><File Name="g" Size="2" TTH="AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"/></Directory>
        </FileListing>"#;
        let fl = read_filelist(xml, false).unwrap();
        let a = fl.child(fl.root(), "A").unwrap();
        // The second directory's subtree was dropped.
        assert_eq!(fl.children(a).len(), 1);
        assert_eq!(fl.size(fl.root()), 1);
    }

    #[test]
    fn missing_root_rejected() {
        assert!(read_filelist(b"<Other/>", false).is_err());
        assert!(read_filelist(b"", false).is_err());
    }

    #[test]
    fn serialization_is_deterministic() {
        let mut fl = FileList::new();
        fl.add_dir(fl.root(), "b").unwrap();
        fl.add_dir(fl.root(), "A").unwrap();
        let one = write_filelist(&fl, false).unwrap();
        let two = write_filelist(&fl, false).unwrap();
        assert_eq!(one, two);
        let text = String::from_utf8(one).unwrap();
        let a_pos = text.find("\"A\"").unwrap();
        let b_pos = text.find("\"b\"").unwrap();
        assert!(a_pos < b_pos);
    }
}
