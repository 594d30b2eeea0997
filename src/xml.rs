//! S3 XML response rendering and request-body parsing.
//!
//! All S3 API responses are XML-encoded.  This module provides helpers
//! that produce the correct XML payloads using `quick-xml`, plus parsers
//! for the `<Delete>`, `<Tagging>`, and `<CompleteMultipartUpload>`
//! request bodies.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;

use crate::errors::S3Error;

const S3_XMLNS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

// ── Writer helpers ──────────────────────────────────────────────────

fn write_decl(writer: &mut Writer<Cursor<Vec<u8>>>) {
    writer
        .write_event(Event::Decl(quick_xml::events::BytesDecl::new(
            "1.0",
            Some("UTF-8"),
            None,
        )))
        .expect("xml decl");
}

fn write_text_element(writer: &mut Writer<Cursor<Vec<u8>>>, name: &str, value: &str) {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .expect("start element");
    writer
        .write_event(Event::Text(BytesText::new(value)))
        .expect("text");
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .expect("end element");
}

/// Write `<group><k1>v1</k1>...</group>`.
fn write_simple_element_group(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    group: &str,
    fields: &[(&str, &str)],
) {
    writer
        .write_event(Event::Start(BytesStart::new(group)))
        .expect("start group");
    for (name, value) in fields {
        write_text_element(writer, name, value);
    }
    writer
        .write_event(Event::End(BytesEnd::new(group)))
        .expect("end group");
}

fn into_string(writer: Writer<Cursor<Vec<u8>>>) -> String {
    String::from_utf8(writer.into_inner().into_inner()).expect("valid utf-8")
}

// ── Error response ──────────────────────────────────────────────────

/// Render an S3 `<Error>` XML document.
///
/// ```xml
/// <?xml version="1.0" encoding="UTF-8"?>
/// <Error>
///   <Code>NoSuchBucket</Code>
///   <Message>The specified bucket does not exist</Message>
///   <Resource>/mybucket</Resource>
///   <RequestId>abcd-1234</RequestId>
/// </Error>
/// ```
pub fn render_error(code: &str, message: &str, resource: &str, request_id: &str) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    write_decl(&mut writer);
    write_simple_element_group(
        &mut writer,
        "Error",
        &[
            ("Code", code),
            ("Message", message),
            ("Resource", resource),
            ("RequestId", request_id),
        ],
    );
    into_string(writer)
}

// ── CopyObjectResult ────────────────────────────────────────────────

/// Render `<CopyObjectResult>` (also used for `<CopyPartResult>` via
/// `root`).
pub fn render_copy_result(root: &str, etag: &str, last_modified: &str) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    write_decl(&mut writer);
    write_simple_element_group(
        &mut writer,
        root,
        &[("LastModified", last_modified), ("ETag", etag)],
    );
    into_string(writer)
}

// ── DeleteResult ────────────────────────────────────────────────────

/// Successfully deleted entry in a multi-object delete response.
pub struct DeletedEntry<'a> {
    pub key: &'a str,
    pub version_id: Option<&'a str>,
    pub delete_marker: bool,
}

/// Failed entry in a multi-object delete response.
pub struct DeleteErrorEntry<'a> {
    pub key: &'a str,
    pub code: &'a str,
    pub message: &'a str,
}

/// Render `<DeleteResult>`.  In quiet mode, successful deletions are
/// omitted; errors are always present.
pub fn render_delete_result(
    deleted: &[DeletedEntry<'_>],
    errors: &[DeleteErrorEntry<'_>],
    quiet: bool,
) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    write_decl(&mut writer);

    let root = BytesStart::new("DeleteResult").with_attributes([("xmlns", S3_XMLNS)]);
    writer.write_event(Event::Start(root)).expect("start root");

    if !quiet {
        for entry in deleted {
            writer
                .write_event(Event::Start(BytesStart::new("Deleted")))
                .expect("start Deleted");
            write_text_element(&mut writer, "Key", entry.key);
            if let Some(vid) = entry.version_id {
                write_text_element(&mut writer, "VersionId", vid);
            }
            if entry.delete_marker {
                write_text_element(&mut writer, "DeleteMarker", "true");
            }
            writer
                .write_event(Event::End(BytesEnd::new("Deleted")))
                .expect("end Deleted");
        }
    }

    for entry in errors {
        write_simple_element_group(
            &mut writer,
            "Error",
            &[
                ("Key", entry.key),
                ("Code", entry.code),
                ("Message", entry.message),
            ],
        );
    }

    writer
        .write_event(Event::End(BytesEnd::new("DeleteResult")))
        .expect("end root");
    into_string(writer)
}

// ── Tagging ─────────────────────────────────────────────────────────

/// Render `<Tagging><TagSet>...</TagSet></Tagging>` from decoded pairs.
pub fn render_tagging(tags: &[(String, String)]) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    write_decl(&mut writer);

    let root = BytesStart::new("Tagging").with_attributes([("xmlns", S3_XMLNS)]);
    writer.write_event(Event::Start(root)).expect("start root");
    writer
        .write_event(Event::Start(BytesStart::new("TagSet")))
        .expect("start TagSet");
    for (k, v) in tags {
        write_simple_element_group(&mut writer, "Tag", &[("Key", k), ("Value", v)]);
    }
    writer
        .write_event(Event::End(BytesEnd::new("TagSet")))
        .expect("end TagSet");
    writer
        .write_event(Event::End(BytesEnd::new("Tagging")))
        .expect("end root");
    into_string(writer)
}

// ── Multipart responses ─────────────────────────────────────────────

/// Render `<InitiateMultipartUploadResult>`.
pub fn render_initiate_mpu_result(bucket: &str, key: &str, upload_id: &str) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    write_decl(&mut writer);

    let root =
        BytesStart::new("InitiateMultipartUploadResult").with_attributes([("xmlns", S3_XMLNS)]);
    writer.write_event(Event::Start(root)).expect("start root");
    write_text_element(&mut writer, "Bucket", bucket);
    write_text_element(&mut writer, "Key", key);
    write_text_element(&mut writer, "UploadId", upload_id);
    writer
        .write_event(Event::End(BytesEnd::new("InitiateMultipartUploadResult")))
        .expect("end root");
    into_string(writer)
}

/// Render `<CompleteMultipartUploadResult>`.
pub fn render_complete_mpu_result(location: &str, bucket: &str, key: &str, etag: &str) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    write_decl(&mut writer);

    let root =
        BytesStart::new("CompleteMultipartUploadResult").with_attributes([("xmlns", S3_XMLNS)]);
    writer.write_event(Event::Start(root)).expect("start root");
    write_text_element(&mut writer, "Location", location);
    write_text_element(&mut writer, "Bucket", bucket);
    write_text_element(&mut writer, "Key", key);
    write_text_element(&mut writer, "ETag", etag);
    writer
        .write_event(Event::End(BytesEnd::new("CompleteMultipartUploadResult")))
        .expect("end root");
    into_string(writer)
}

/// One part entry inside a `<ListPartsResult>`.
pub struct PartEntry<'a> {
    pub part_number: u32,
    pub etag: &'a str,
    pub size: u64,
    pub last_modified: &'a str,
}

/// Render `<ListPartsResult>`.
pub fn render_list_parts_result(
    bucket: &str,
    key: &str,
    upload_id: &str,
    parts: &[PartEntry<'_>],
    is_truncated: bool,
) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    write_decl(&mut writer);

    let root = BytesStart::new("ListPartsResult").with_attributes([("xmlns", S3_XMLNS)]);
    writer.write_event(Event::Start(root)).expect("start root");
    write_text_element(&mut writer, "Bucket", bucket);
    write_text_element(&mut writer, "Key", key);
    write_text_element(&mut writer, "UploadId", upload_id);
    write_text_element(
        &mut writer,
        "IsTruncated",
        if is_truncated { "true" } else { "false" },
    );
    for part in parts {
        write_simple_element_group(
            &mut writer,
            "Part",
            &[
                ("PartNumber", &part.part_number.to_string()),
                ("LastModified", part.last_modified),
                ("ETag", part.etag),
                ("Size", &part.size.to_string()),
            ],
        );
    }
    writer
        .write_event(Event::End(BytesEnd::new("ListPartsResult")))
        .expect("end root");
    into_string(writer)
}

// ── Request-body parsers ────────────────────────────────────────────

/// One `<Object>` entry of a `<Delete>` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteObjectEntry {
    pub key: String,
    pub version_id: Option<String>,
}

/// Parse the `<Delete>` XML body of a multi-object delete.
///
/// Returns the entries and the quiet flag.
pub fn parse_delete_xml(body: &[u8]) -> Result<(Vec<DeleteObjectEntry>, bool), S3Error> {
    let mut reader = Reader::from_reader(body);
    reader.trim_text(true);

    let mut entries = Vec::new();
    let mut quiet = false;
    let mut current_tag = String::new();
    let mut in_object = false;
    let mut current_key: Option<String> = None;
    let mut current_version: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let tag_name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if tag_name == "Object" {
                    in_object = true;
                    current_key = None;
                    current_version = None;
                }
                current_tag = tag_name;
            }
            Ok(Event::End(ref e)) => {
                let tag_name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if tag_name == "Object" {
                    in_object = false;
                    match current_key.take() {
                        Some(key) => entries.push(DeleteObjectEntry {
                            key,
                            version_id: current_version.take(),
                        }),
                        None => return Err(S3Error::MalformedXML),
                    }
                }
                current_tag.clear();
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().unwrap_or_default().to_string();
                if in_object && current_tag == "Key" {
                    current_key = Some(text);
                } else if in_object && current_tag == "VersionId" {
                    current_version = Some(text);
                } else if current_tag == "Quiet" {
                    quiet = text == "true";
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => return Err(S3Error::MalformedXML),
            _ => {}
        }
        buf.clear();
    }

    Ok((entries, quiet))
}

/// Parse a `<Tagging>` XML body into the query-string form the data
/// gateway consumes (`k=v&k2=v2`, percent-encoded).
pub fn parse_tagging_xml(body: &[u8]) -> Result<String, S3Error> {
    let mut reader = Reader::from_reader(body);
    reader.trim_text(true);

    let mut pairs: Vec<(String, String)> = Vec::new();
    let mut current_tag = String::new();
    let mut in_tag = false;
    let mut key: Option<String> = None;
    let mut value: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let tag_name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if tag_name == "Tag" {
                    in_tag = true;
                    key = None;
                    value = None;
                }
                current_tag = tag_name;
            }
            Ok(Event::End(ref e)) => {
                let tag_name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if tag_name == "Tag" {
                    in_tag = false;
                    match (key.take(), value.take()) {
                        (Some(k), Some(v)) => pairs.push((k, v)),
                        _ => return Err(S3Error::MalformedXML),
                    }
                }
                current_tag.clear();
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().unwrap_or_default().to_string();
                if in_tag && current_tag == "Key" {
                    key = Some(text);
                } else if in_tag && current_tag == "Value" {
                    value = Some(text);
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => return Err(S3Error::MalformedXML),
            _ => {}
        }
        buf.clear();
    }

    Ok(encode_tag_query(&pairs))
}

/// Encode tag pairs as the `k=v&k2=v2` query-string form.
pub fn encode_tag_query(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                percent_encoding::utf8_percent_encode(k, percent_encoding::NON_ALPHANUMERIC),
                percent_encoding::utf8_percent_encode(v, percent_encoding::NON_ALPHANUMERIC)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Decode the `k=v&k2=v2` query-string tag form back into pairs.
pub fn decode_tag_query(tagging: &str) -> Vec<(String, String)> {
    tagging
        .split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let k = percent_encoding::percent_decode_str(k)
                .decode_utf8_lossy()
                .into_owned();
            let v = percent_encoding::percent_decode_str(v)
                .decode_utf8_lossy()
                .into_owned();
            Some((k, v))
        })
        .collect()
}

/// Parse `<CompleteMultipartUpload>` into `(part_number, etag)` pairs in
/// document order.
pub fn parse_complete_mpu_xml(body: &[u8]) -> Result<Vec<(u32, String)>, S3Error> {
    let mut reader = Reader::from_reader(body);
    reader.trim_text(true);

    let mut parts = Vec::new();
    let mut current_tag = String::new();
    let mut in_part = false;
    let mut part_number: Option<u32> = None;
    let mut etag: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let tag_name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if tag_name == "Part" {
                    in_part = true;
                    part_number = None;
                    etag = None;
                }
                current_tag = tag_name;
            }
            Ok(Event::End(ref e)) => {
                let tag_name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if tag_name == "Part" {
                    in_part = false;
                    match (part_number.take(), etag.take()) {
                        (Some(n), Some(t)) => parts.push((n, t)),
                        _ => return Err(S3Error::MalformedXML),
                    }
                }
                current_tag.clear();
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().unwrap_or_default().to_string();
                if in_part && current_tag == "PartNumber" {
                    part_number = Some(text.parse().map_err(|_| S3Error::MalformedXML)?);
                } else if in_part && current_tag == "ETag" {
                    etag = Some(text);
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => return Err(S3Error::MalformedXML),
            _ => {}
        }
        buf.clear();
    }

    if parts.is_empty() {
        return Err(S3Error::MalformedXML);
    }
    Ok(parts)
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_error_shape() {
        let xml = render_error("NoSuchKey", "The specified key does not exist", "/b/k", "RID");
        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains("<Code>NoSuchKey</Code>"));
        assert!(xml.contains("<Resource>/b/k</Resource>"));
        assert!(xml.contains("<RequestId>RID</RequestId>"));
    }

    #[test]
    fn test_render_delete_result_quiet_omits_deleted() {
        let deleted = [DeletedEntry {
            key: "a",
            version_id: None,
            delete_marker: false,
        }];
        let errors = [DeleteErrorEntry {
            key: "b",
            code: "AccessDenied",
            message: "Access Denied",
        }];

        let loud = render_delete_result(&deleted, &errors, false);
        assert!(loud.contains("<Deleted>"));
        assert!(loud.contains("<Key>a</Key>"));

        let quiet = render_delete_result(&deleted, &errors, true);
        assert!(!quiet.contains("<Deleted>"));
        // Errors are always reported.
        assert!(quiet.contains("<Code>AccessDenied</Code>"));
    }

    #[test]
    fn test_parse_delete_xml() {
        let body = br#"<Delete>
            <Quiet>true</Quiet>
            <Object><Key>one</Key></Object>
            <Object><Key>two</Key><VersionId>v2</VersionId></Object>
        </Delete>"#;
        let (entries, quiet) = parse_delete_xml(body).unwrap();
        assert!(quiet);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, "one");
        assert_eq!(entries[1].version_id.as_deref(), Some("v2"));
    }

    #[test]
    fn test_parse_delete_xml_malformed() {
        assert!(parse_delete_xml(b"<Delete><Object></Object></Delete>").is_err());
        assert!(parse_delete_xml(b"not xml <<<").is_err());
    }

    #[test]
    fn test_parse_tagging_xml_to_query() {
        let body = br#"<Tagging><TagSet>
            <Tag><Key>color</Key><Value>blue</Value></Tag>
            <Tag><Key>env</Key><Value>prod</Value></Tag>
        </TagSet></Tagging>"#;
        let query = parse_tagging_xml(body).unwrap();
        assert_eq!(query, "color=blue&env=prod");
    }

    #[test]
    fn test_parse_tagging_xml_encodes_special_chars() {
        let body = br#"<Tagging><TagSet>
            <Tag><Key>a b</Key><Value>c&amp;d</Value></Tag>
        </TagSet></Tagging>"#;
        let query = parse_tagging_xml(body).unwrap();
        assert_eq!(query, "a%20b=c%26d");
    }

    #[test]
    fn test_parse_complete_mpu_xml() {
        let body = br#"<CompleteMultipartUpload>
            <Part><PartNumber>1</PartNumber><ETag>"aaa"</ETag></Part>
            <Part><PartNumber>2</PartNumber><ETag>"bbb"</ETag></Part>
        </CompleteMultipartUpload>"#;
        let parts = parse_complete_mpu_xml(body).unwrap();
        assert_eq!(parts, vec![(1, "\"aaa\"".to_string()), (2, "\"bbb\"".to_string())]);
    }

    #[test]
    fn test_parse_complete_mpu_xml_empty_is_malformed() {
        assert!(parse_complete_mpu_xml(b"<CompleteMultipartUpload></CompleteMultipartUpload>").is_err());
    }

    #[test]
    fn test_render_tagging_roundtrip_shape() {
        let xml = render_tagging(&[("k".to_string(), "v".to_string())]);
        assert!(xml.contains("<TagSet>"));
        assert!(xml.contains("<Key>k</Key>"));
        assert!(xml.contains("<Value>v</Value>"));
    }
}
