use std::io::{self, Cursor, Seek, Write};

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::Writer as XmlWriter;
use zip::{write::FileOptions, CompressionMethod, ZipWriter};

use crate::error::{Error, Result};

/// Media type of the container itself, stored in the root descriptor entry.
pub const CONTAINER_MIME_TYPE: &str = "application/vnd.etsi.asic-e+zip";

const MIMETYPE_ENTRY: &str = "mimetype";
const MANIFEST_ENTRY: &str = "META-INF/manifest.xml";
const MANIFEST_NS: &str = "urn:oasis:names:tc:opendocument:xmlns:manifest:1.0";

/// Streaming writer for ASiC-E style evidentiary containers.
///
/// Opening the builder immediately writes the fixed root descriptor: a
/// `mimetype` entry stored without compression, which the container format
/// requires as its first, magic-bytes-readable entry. Callers then append
/// named, mime-typed entries (whole buffers or streamed through
/// [`io::Write`]) and must call [`finalize`](Self::finalize) exactly once,
/// which writes the manifest listing every entry and closes the archive.
pub struct ContainerBuilder<W: Write + Seek> {
    zip: ZipWriter<W>,
    entries: Vec<(String, String)>,
    entry_open: bool,
    finalized: bool,
}

impl<W: Write + Seek> ContainerBuilder<W> {
    /// Open a new container over the given sink.
    pub fn open(sink: W) -> Result<Self> {
        let mut zip = ZipWriter::new(sink);
        let stored = FileOptions::default().compression_method(CompressionMethod::Stored);
        zip.start_file(MIMETYPE_ENTRY, stored)?;
        zip.write_all(CONTAINER_MIME_TYPE.as_bytes())?;
        Ok(Self {
            zip,
            entries: Vec::new(),
            entry_open: false,
            finalized: false,
        })
    }

    /// The `(name, mime type)` pairs appended so far, in insertion order.
    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    fn check_entry(&self, name: &str, mime_type: &str) -> Result<()> {
        if self.finalized {
            return Err(Error::AlreadyFinalized);
        }
        if name.is_empty() {
            return Err(Error::InvalidEntry("entry name is empty".to_string()));
        }
        if mime_type.is_empty() {
            return Err(Error::InvalidEntry(format!(
                "entry {name:?} has an empty mime type"
            )));
        }
        if name == MIMETYPE_ENTRY || name == MANIFEST_ENTRY {
            return Err(Error::InvalidEntry(format!(
                "entry name {name:?} is reserved"
            )));
        }
        if self.entries.iter().any(|(existing, _)| existing == name) {
            return Err(Error::InvalidEntry(format!(
                "duplicate entry name {name:?}"
            )));
        }
        Ok(())
    }

    /// Begin a streamed entry. Content is subsequently written through the
    /// builder's [`io::Write`] implementation; the entry is closed by the
    /// next `start_entry`/`append`/`finalize` call.
    pub fn start_entry(&mut self, name: &str, mime_type: &str) -> Result<()> {
        self.check_entry(name, mime_type)?;
        self.zip.start_file(name, FileOptions::default())?;
        self.entries
            .push((name.to_string(), mime_type.to_string()));
        self.entry_open = true;
        Ok(())
    }

    /// Append a complete entry.
    pub fn append(&mut self, name: &str, mime_type: &str, content: &[u8]) -> Result<()> {
        self.start_entry(name, mime_type)?;
        self.zip.write_all(content)?;
        self.entry_open = false;
        Ok(())
    }

    /// Write the manifest and close the archive, returning the sink.
    ///
    /// Fails with [`Error::AlreadyFinalized`] on a second call.
    pub fn finalize(&mut self) -> Result<W> {
        if self.finalized {
            return Err(Error::AlreadyFinalized);
        }
        let manifest = self.manifest_xml()?;
        self.zip.start_file(MANIFEST_ENTRY, FileOptions::default())?;
        self.zip.write_all(&manifest)?;
        self.entry_open = false;
        self.finalized = true;
        Ok(self.zip.finish()?)
    }

    /// Render `META-INF/manifest.xml`: the root entry declaring the container
    /// media type, then one file entry per appended entry in insertion order.
    fn manifest_xml(&self) -> Result<Vec<u8>> {
        fn xml_err(e: quick_xml::Error) -> Error {
            Error::Io(io::Error::new(io::ErrorKind::Other, e))
        }

        let mut writer = XmlWriter::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_err)?;

        let mut root = BytesStart::new("manifest:manifest");
        root.push_attribute(("xmlns:manifest", MANIFEST_NS));
        writer.write_event(Event::Start(root)).map_err(xml_err)?;

        let mut container = BytesStart::new("manifest:file-entry");
        container.push_attribute(("manifest:full-path", "/"));
        container.push_attribute(("manifest:media-type", CONTAINER_MIME_TYPE));
        writer.write_event(Event::Empty(container)).map_err(xml_err)?;

        for (name, mime_type) in &self.entries {
            let mut entry = BytesStart::new("manifest:file-entry");
            entry.push_attribute(("manifest:full-path", name.as_str()));
            entry.push_attribute(("manifest:media-type", mime_type.as_str()));
            writer.write_event(Event::Empty(entry)).map_err(xml_err)?;
        }

        writer
            .write_event(Event::End(BytesEnd::new("manifest:manifest")))
            .map_err(xml_err)?;
        Ok(writer.into_inner().into_inner())
    }
}

impl<W: Write + Seek> Write for ContainerBuilder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.entry_open {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "no container entry open for writing",
            ));
        }
        self.zip.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.zip.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use zip::ZipArchive;

    use super::*;

    fn build<F>(f: F) -> Vec<u8>
    where
        F: FnOnce(&mut ContainerBuilder<Cursor<Vec<u8>>>),
    {
        let mut builder = ContainerBuilder::open(Cursor::new(Vec::new())).unwrap();
        f(&mut builder);
        builder.finalize().unwrap().into_inner()
    }

    fn read_entry(archive: &mut ZipArchive<Cursor<Vec<u8>>>, name: &str) -> String {
        let mut content = String::new();
        archive
            .by_name(name)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        content
    }

    #[test]
    fn root_descriptor_is_first_and_stored() {
        let bytes = build(|b| {
            b.append("ballot.txt", "text/plain", b"yes").unwrap();
        });
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();

        let first = archive.by_index(0).unwrap();
        assert_eq!(first.name(), "mimetype");
        assert_eq!(first.compression(), CompressionMethod::Stored);
        drop(first);

        assert_eq!(read_entry(&mut archive, "mimetype"), CONTAINER_MIME_TYPE);
    }

    #[test]
    fn manifest_lists_exactly_the_appended_entries() {
        let bytes = build(|b| {
            b.append("document.html", "text/html", b"<p>ballot</p>").unwrap();
            b.append("metadata.json", "application/json", b"{}").unwrap();
        });
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let manifest = read_entry(&mut archive, "META-INF/manifest.xml");

        assert!(manifest.contains(
            r#"<manifest:file-entry manifest:full-path="/" manifest:media-type="application/vnd.etsi.asic-e+zip"/>"#
        ));
        assert!(manifest.contains(
            r#"<manifest:file-entry manifest:full-path="document.html" manifest:media-type="text/html"/>"#
        ));
        assert!(manifest.contains(
            r#"<manifest:file-entry manifest:full-path="metadata.json" manifest:media-type="application/json"/>"#
        ));
        // Root plus the two appended entries, no more, no fewer.
        assert_eq!(manifest.matches("manifest:file-entry").count(), 3);
        // Manifest order matches insertion order.
        let doc_pos = manifest.find("document.html").unwrap();
        let meta_pos = manifest.find("metadata.json").unwrap();
        assert!(doc_pos < meta_pos);
    }

    #[test]
    fn streamed_entries_round_trip() {
        let bytes = build(|b| {
            b.start_entry("votes.csv", "text/csv").unwrap();
            b.write_all(b"voter,choice\n").unwrap();
            b.write_all(b"abc,Yes\n").unwrap();
        });
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(read_entry(&mut archive, "votes.csv"), "voter,choice\nabc,Yes\n");
    }

    #[test]
    fn duplicate_entry_name_is_rejected() {
        let mut builder = ContainerBuilder::open(Cursor::new(Vec::new())).unwrap();
        builder.append("a.txt", "text/plain", b"1").unwrap();
        assert!(matches!(
            builder.append("a.txt", "text/plain", b"2"),
            Err(Error::InvalidEntry(_))
        ));
    }

    #[test]
    fn empty_name_and_mime_are_rejected() {
        let mut builder = ContainerBuilder::open(Cursor::new(Vec::new())).unwrap();
        assert!(matches!(
            builder.append("", "text/plain", b""),
            Err(Error::InvalidEntry(_))
        ));
        assert!(matches!(
            builder.append("a.txt", "", b""),
            Err(Error::InvalidEntry(_))
        ));
    }

    #[test]
    fn reserved_names_are_rejected() {
        let mut builder = ContainerBuilder::open(Cursor::new(Vec::new())).unwrap();
        assert!(matches!(
            builder.append("mimetype", "text/plain", b""),
            Err(Error::InvalidEntry(_))
        ));
        assert!(matches!(
            builder.append("META-INF/manifest.xml", "text/xml", b""),
            Err(Error::InvalidEntry(_))
        ));
    }

    #[test]
    fn append_after_finalize_fails() {
        let mut builder = ContainerBuilder::open(Cursor::new(Vec::new())).unwrap();
        builder.append("a.txt", "text/plain", b"1").unwrap();
        builder.finalize().unwrap();
        assert!(matches!(
            builder.append("b.txt", "text/plain", b"2"),
            Err(Error::AlreadyFinalized)
        ));
    }

    #[test]
    fn finalize_twice_fails() {
        let mut builder = ContainerBuilder::open(Cursor::new(Vec::new())).unwrap();
        builder.finalize().unwrap();
        assert!(matches!(builder.finalize(), Err(Error::AlreadyFinalized)));
    }
}
