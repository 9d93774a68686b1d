use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// One decoded line from a plain-text pattern list: `pattern [attrs] [#
/// comment]`, attrs being a comma-separated list of bare tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEntry {
    pub pattern: String,
    pub attrs: Vec<String>,
}

/// Loads a plain text pattern-list file, one entry per non-empty,
/// non-comment line. `#` starts a trailing comment.
pub fn load_text_list(path: &Path) -> Result<Vec<TextEntry>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read pattern list: {}", path.display()))?;
    let mut out = Vec::new();
    for line in raw.lines() {
        let line = match line.split('#').next() {
            Some(s) => s.trim(),
            None => continue,
        };
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let pattern = parts
            .next()
            .ok_or_else(|| anyhow!("empty pattern line"))?
            .to_string();
        let attrs = parts
            .flat_map(|p| p.split(','))
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();
        out.push(TextEntry { pattern, attrs });
    }
    Ok(out)
}

/// Parses a `path:TAG[@attr...]` reference into its components, the
/// convention used to select a named list out of a v2ray GeoSite/GeoIP
/// proto blob.
pub fn parse_geo_ref(spec: &str) -> Result<(&str, &str, Vec<&str>)> {
    let (path, rest) = spec
        .split_once(':')
        .ok_or_else(|| anyhow!("geo reference missing ':' separator: {spec}"))?;
    let mut pieces = rest.split('@');
    let tag = pieces
        .next()
        .ok_or_else(|| anyhow!("geo reference missing tag: {spec}"))?;
    let attrs = pieces.collect();
    Ok((path, tag, attrs))
}

/// Minimal protobuf field walker: enough to pull length-delimited entries
/// and their nested varint/string fields out of a GeoSite/GeoIP blob
/// without depending on a full protobuf codegen pipeline.
pub struct ProtoReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

pub enum ProtoValue<'a> {
    Varint(u64),
    Bytes(&'a [u8]),
}

impl<'a> ProtoReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_varint(&mut self) -> Option<u64> {
        let mut result: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = *self.buf.get(self.pos)?;
            self.pos += 1;
            result |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Some(result);
            }
            shift += 7;
            if shift >= 64 {
                return None;
            }
        }
    }

    /// Returns `(field_number, value)` for the next field, or `None` at end
    /// of buffer.
    pub fn next_field(&mut self) -> Option<(u32, ProtoValue<'a>)> {
        if self.pos >= self.buf.len() {
            return None;
        }
        let tag = self.read_varint()?;
        let field_number = (tag >> 3) as u32;
        let wire_type = tag & 0x7;
        match wire_type {
            0 => {
                let v = self.read_varint()?;
                Some((field_number, ProtoValue::Varint(v)))
            }
            2 => {
                let len = self.read_varint()? as usize;
                if self.pos + len > self.buf.len() {
                    return None;
                }
                let slice = &self.buf[self.pos..self.pos + len];
                self.pos += len;
                Some((field_number, ProtoValue::Bytes(slice)))
            }
            _ => None, // fixed32/fixed64 not used by GeoSite/GeoIP
        }
    }
}

/// Decodes a GeoSite-style blob into tag -> list of raw domain rule bytes
/// (each entry still protobuf-encoded `Domain` messages; callers further
/// decode per-entry type/value with `ProtoReader`).
pub fn decode_geosite(blob: &[u8]) -> HashMap<String, Vec<Vec<u8>>> {
    let mut out: HashMap<String, Vec<Vec<u8>>> = HashMap::new();
    let mut top = ProtoReader::new(blob);
    // GeoSiteList { repeated GeoSite entry = 1 }
    while let Some((field, value)) = top.next_field() {
        if field != 1 {
            continue;
        }
        if let ProtoValue::Bytes(entry_bytes) = value {
            let mut country = String::new();
            let mut domains = Vec::new();
            let mut reader = ProtoReader::new(entry_bytes);
            // GeoSite { string country_code = 1; repeated Domain domain = 2 }
            while let Some((f, v)) = reader.next_field() {
                match (f, v) {
                    (1, ProtoValue::Bytes(b)) => {
                        country = String::from_utf8_lossy(b).to_uppercase();
                    }
                    (2, ProtoValue::Bytes(b)) => domains.push(b.to_vec()),
                    _ => {}
                }
            }
            if !country.is_empty() {
                out.entry(country).or_default().extend(domains);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_geo_ref_splits_path_tag_attrs() {
        let (path, tag, attrs) = parse_geo_ref("geosite.dat:cn@ads").unwrap();
        assert_eq!(path, "geosite.dat");
        assert_eq!(tag, "cn");
        assert_eq!(attrs, vec!["ads"]);
    }

    #[test]
    fn load_text_list_parses_lines() {
        let mut file = tempfile_like();
        writeln!(file.as_file_mut(), "full:example.com").unwrap();
        writeln!(file.as_file_mut(), "domain:ads.com cn,ads # block ads").unwrap();
        writeln!(file.as_file_mut(), "# comment only").unwrap();
        writeln!(file.as_file_mut(), "   ").unwrap();
        let entries = load_text_list(file.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].pattern, "full:example.com");
        assert!(entries[0].attrs.is_empty());
        assert_eq!(entries[1].pattern, "domain:ads.com");
        assert_eq!(entries[1].attrs, vec!["cn".to_string(), "ads".to_string()]);
    }

    #[test]
    fn proto_reader_walks_varint_and_bytes_fields() {
        // field 1 varint=150, field 2 bytes="hi"
        let buf = vec![0x08, 0x96, 0x01, 0x12, 0x02, b'h', b'i'];
        let mut reader = ProtoReader::new(&buf);
        let (f1, v1) = reader.next_field().unwrap();
        assert_eq!(f1, 1);
        assert!(matches!(v1, ProtoValue::Varint(150)));
        let (f2, v2) = reader.next_field().unwrap();
        assert_eq!(f2, 2);
        match v2 {
            ProtoValue::Bytes(b) => assert_eq!(b, b"hi"),
            _ => panic!("expected bytes"),
        }
        assert!(reader.next_field().is_none());
    }

    // Minimal helper to avoid pulling in the `tempfile` crate for one test file.
    struct SimpleTempFile {
        path: std::path::PathBuf,
        file: fs::File,
    }

    impl SimpleTempFile {
        fn as_file_mut(&mut self) -> &mut fs::File {
            &mut self.file
        }

        fn path(&self) -> &Path {
            &self.path
        }
    }

    impl Drop for SimpleTempFile {
        fn drop(&mut self) {
            let _ = fs::remove_file(&self.path);
        }
    }

    fn tempfile_like() -> SimpleTempFile {
        let path = std::env::temp_dir().join(format!(
            "kixdns-test-{}-{}.txt",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let file = fs::File::create(&path).unwrap();
        SimpleTempFile { path, file }
    }
}
