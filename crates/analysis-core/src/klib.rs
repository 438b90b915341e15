//! Klib-Stub Generator (§4.3). Klib binaries carry ProtoBuf-serialized
//! declaration metadata instead of source; the Analysis Backend can only
//! consume source, so this module walks the metadata and emits minimal,
//! type-faithful `.kt` stub files into a temp directory that gets added as a
//! source root for the matching platform session.
//!
//! There's no `.proto` schema in reach here, so rather than depending on a
//! generated protobuf crate we read the wire format by hand: just enough of
//! varints, tags and length-delimited fields to walk a `PackageFragment`
//! message's string table, qualified-name table, and declaration lists.
//! Anything we don't recognize is skipped, not failed — stub generation is
//! best-effort per fragment and per declaration (§4.3 "Error handling").

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::warn;

/// Field numbers assumed for the `PackageFragment` message. These mirror the
/// shape described in §4.3 (string table + qualified-name table + top-level
/// declarations) closely enough to extract faithful signatures; anything
/// that doesn't parse this way is simply skipped.
mod field {
    pub const STRING_TABLE: u64 = 1;
    pub const QUALIFIED_NAME_TABLE: u64 = 2;
    pub const CLASSES: u64 = 3;
    pub const FUNCTIONS: u64 = 4;
    pub const PROPERTIES: u64 = 5;
}

mod qname_field {
    pub const PARENT_INDEX: u64 = 1;
    pub const SHORT_NAME_INDEX: u64 = 2;
}

mod decl_field {
    pub const FLAGS: u64 = 1;
    pub const NAME_INDEX: u64 = 2;
    pub const TYPE_PARAMETERS: u64 = 3;
    pub const SUPERTYPES: u64 = 4;
    pub const RECEIVER_TYPE: u64 = 5;
    pub const VALUE_PARAMETERS: u64 = 6;
    pub const RETURN_TYPE: u64 = 7;
    pub const NESTED_CLASSES: u64 = 8;
    pub const MEMBER_FUNCTIONS: u64 = 9;
    pub const MEMBER_PROPERTIES: u64 = 10;
    pub const VISIBILITY: u64 = 11;
    pub const MODALITY: u64 = 12;
    pub const CLASS_KIND: u64 = 13;
    pub const IS_SUSPEND: u64 = 14;
}

mod type_field {
    pub const NAME_INDEX: u64 = 1;
    pub const NULLABLE: u64 = 2;
    pub const ARGUMENTS: u64 = 3;
    pub const STAR_PROJECTION: u64 = 4;
    pub const VARIANCE: u64 = 5;
}

mod value_param_field {
    pub const NAME_INDEX: u64 = 1;
    pub const TYPE: u64 = 2;
}

// ---- generic wire-format walker -------------------------------------------------

#[derive(Debug, Clone)]
enum WireValue {
    Varint(u64),
    LengthDelimited(Vec<u8>),
}

#[derive(Debug, Clone)]
struct Field {
    tag: u64,
    value: WireValue,
}

fn read_varint(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let mut result: u64 = 0;
    let mut shift = 0;
    loop {
        let byte = *buf.get(*pos)?;
        *pos += 1;
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

fn parse_fields(buf: &[u8]) -> Vec<Field> {
    let mut fields = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        let Some(key) = read_varint(buf, &mut pos) else { break };
        let tag = key >> 3;
        let wire_type = key & 0x7;
        let value = match wire_type {
            0 => {
                let Some(v) = read_varint(buf, &mut pos) else { break };
                WireValue::Varint(v)
            }
            2 => {
                let Some(len) = read_varint(buf, &mut pos) else { break };
                let len = len as usize;
                if pos + len > buf.len() {
                    break;
                }
                let bytes = buf[pos..pos + len].to_vec();
                pos += len;
                WireValue::LengthDelimited(bytes)
            }
            1 => {
                if pos + 8 > buf.len() {
                    break;
                }
                pos += 8;
                continue;
            }
            5 => {
                if pos + 4 > buf.len() {
                    break;
                }
                pos += 4;
                continue;
            }
            _ => break,
        };
        fields.push(Field { tag, value });
    }
    fields
}

fn string_fields(fields: &[Field], tag: u64) -> Vec<String> {
    fields
        .iter()
        .filter(|f| f.tag == tag)
        .filter_map(|f| match &f.value {
            WireValue::LengthDelimited(bytes) => String::from_utf8(bytes.clone()).ok(),
            _ => None,
        })
        .collect()
}

fn message_fields(fields: &[Field], tag: u64) -> Vec<Vec<Field>> {
    fields
        .iter()
        .filter(|f| f.tag == tag)
        .filter_map(|f| match &f.value {
            WireValue::LengthDelimited(bytes) => Some(parse_fields(bytes)),
            _ => None,
        })
        .collect()
}

fn varint_field(fields: &[Field], tag: u64) -> Option<u64> {
    fields.iter().find(|f| f.tag == tag).and_then(|f| match f.value {
        WireValue::Varint(v) => Some(v),
        _ => None,
    })
}

// ---- declaration model -----------------------------------------------------------

struct StringTable(Vec<String>);

impl StringTable {
    fn get(&self, index: u64) -> Option<&str> {
        self.0.get(index as usize).map(|s| s.as_str())
    }
}

struct QualifiedNameTable {
    entries: Vec<(Option<u64>, u64)>,
}

impl QualifiedNameTable {
    fn resolve(&self, strings: &StringTable, index: u64) -> String {
        let mut parts = Vec::new();
        let mut cursor = Some(index);
        let mut guard = 0;
        while let Some(i) = cursor {
            guard += 1;
            if guard > 64 {
                break;
            }
            let Some(&(parent, short)) = self.entries.get(i as usize) else { break };
            parts.push(strings.get(short).unwrap_or("?").to_string());
            cursor = parent;
        }
        parts.reverse();
        parts.join(".")
    }
}

const VISIBILITY_PUBLIC: u64 = 0;
const VISIBILITY_PROTECTED: u64 = 1;

const MODALITY_FINAL: u64 = 0;
const MODALITY_OPEN: u64 = 1;
const MODALITY_ABSTRACT: u64 = 2;
const MODALITY_SEALED: u64 = 3;

const CLASS_KIND_CLASS: u64 = 0;
const CLASS_KIND_INTERFACE: u64 = 1;
const CLASS_KIND_OBJECT: u64 = 2;
const CLASS_KIND_ENUM_CLASS: u64 = 3;
const CLASS_KIND_ANNOTATION_CLASS: u64 = 4;
const CLASS_KIND_COMPANION_OBJECT: u64 = 5;

fn is_exported_visibility(visibility: u64) -> bool {
    visibility == VISIBILITY_PUBLIC || visibility == VISIBILITY_PROTECTED
}

fn render_type(fields: &[Field], strings: &StringTable, qnames: &QualifiedNameTable) -> String {
    if varint_field(fields, type_field::STAR_PROJECTION).unwrap_or(0) == 1 {
        return "*".to_string();
    }
    let name = varint_field(fields, type_field::NAME_INDEX)
        .map(|i| qnames.resolve(strings, i))
        .unwrap_or_else(|| "Any".to_string());
    let nullable = varint_field(fields, type_field::NULLABLE).unwrap_or(0) == 1;
    let args = message_fields(fields, type_field::ARGUMENTS);
    let variance_prefix = match varint_field(fields, type_field::VARIANCE) {
        Some(1) => "out ",
        Some(2) => "in ",
        _ => "",
    };
    let mut rendered = format!("{variance_prefix}{name}");
    if !args.is_empty() {
        let rendered_args: Vec<String> = args
            .iter()
            .map(|a| render_type(a, strings, qnames))
            .collect();
        rendered.push('<');
        rendered.push_str(&rendered_args.join(", "));
        rendered.push('>');
    }
    if nullable {
        rendered.push('?');
    }
    rendered
}

fn render_value_parameters(fields: &[Field], strings: &StringTable, qnames: &QualifiedNameTable) -> String {
    let params = message_fields(fields, decl_field::VALUE_PARAMETERS);
    let rendered: Vec<String> = params
        .iter()
        .map(|p| {
            let name = varint_field(p, value_param_field::NAME_INDEX)
                .and_then(|i| strings.get(i).map(str::to_string))
                .unwrap_or_else(|| "p".to_string());
            let ty = message_fields(p, value_param_field::TYPE)
                .first()
                .map(|t| render_type(t, strings, qnames))
                .unwrap_or_else(|| "Any?".to_string());
            format!("{name}: {ty}")
        })
        .collect();
    rendered.join(", ")
}

fn modifiers(fields: &[Field]) -> Vec<&'static str> {
    let mut mods = Vec::new();
    match varint_field(fields, decl_field::MODALITY) {
        Some(MODALITY_ABSTRACT) => mods.push("abstract"),
        Some(MODALITY_OPEN) => mods.push("open"),
        Some(MODALITY_SEALED) => mods.push("sealed"),
        _ => {}
    }
    if varint_field(fields, decl_field::IS_SUSPEND).unwrap_or(0) == 1 {
        mods.push("suspend");
    }
    mods
}

fn class_keyword(class_kind: u64) -> &'static str {
    match class_kind {
        CLASS_KIND_INTERFACE => "interface",
        CLASS_KIND_OBJECT => "object",
        CLASS_KIND_COMPANION_OBJECT => "companion object",
        CLASS_KIND_ENUM_CLASS => "enum class",
        CLASS_KIND_ANNOTATION_CLASS => "annotation class",
        CLASS_KIND_CLASS => "class",
        _ => "class",
    }
}

fn emit_class(
    fields: &[Field],
    strings: &StringTable,
    qnames: &QualifiedNameTable,
    indent: &str,
    out: &mut String,
    recurse: bool,
) {
    let visibility = varint_field(fields, decl_field::VISIBILITY).unwrap_or(VISIBILITY_PUBLIC);
    if !is_exported_visibility(visibility) {
        return;
    }
    let Some(name_index) = varint_field(fields, decl_field::NAME_INDEX) else { return };
    let short_name = strings.get(name_index).unwrap_or("Unknown").to_string();
    let class_kind = varint_field(fields, decl_field::CLASS_KIND).unwrap_or(CLASS_KIND_CLASS);
    let keyword = class_keyword(class_kind);
    let mods = modifiers(fields);
    let type_params: Vec<String> = message_fields(fields, decl_field::TYPE_PARAMETERS)
        .iter()
        .filter_map(|tp| varint_field(tp, decl_field::NAME_INDEX))
        .filter_map(|i| strings.get(i).map(str::to_string))
        .collect();
    let type_param_clause = if type_params.is_empty() {
        String::new()
    } else {
        format!("<{}>", type_params.join(", "))
    };
    let supertypes: Vec<String> = message_fields(fields, decl_field::SUPERTYPES)
        .iter()
        .map(|t| render_type(t, strings, qnames))
        .filter(|t| t != "Any")
        .collect();
    let supertype_clause = if supertypes.is_empty() {
        String::new()
    } else {
        format!(" : {}", supertypes.join(", "))
    };

    let mod_prefix = if mods.is_empty() {
        String::new()
    } else {
        format!("{} ", mods.join(" "))
    };

    out.push_str(indent);
    out.push_str(&format!(
        "{mod_prefix}{keyword} {short_name}{type_param_clause}{supertype_clause} {{\n"
    ));

    if recurse {
        let member_indent = format!("{indent}    ");
        for func in message_fields(fields, decl_field::MEMBER_FUNCTIONS) {
            emit_function(&func, strings, qnames, &member_indent, out);
        }
        for prop in message_fields(fields, decl_field::MEMBER_PROPERTIES) {
            emit_property(&prop, strings, qnames, &member_indent, out);
        }
        for nested in message_fields(fields, decl_field::NESTED_CLASSES) {
            emit_class(&nested, strings, qnames, &member_indent, out, false);
        }
    }

    out.push_str(indent);
    out.push_str("}\n\n");
}

fn emit_function(
    fields: &[Field],
    strings: &StringTable,
    qnames: &QualifiedNameTable,
    indent: &str,
    out: &mut String,
) {
    let visibility = varint_field(fields, decl_field::VISIBILITY).unwrap_or(VISIBILITY_PUBLIC);
    if !is_exported_visibility(visibility) {
        return;
    }
    let Some(name_index) = varint_field(fields, decl_field::NAME_INDEX) else { return };
    let name = strings.get(name_index).unwrap_or("unknown").to_string();
    let mods = modifiers(fields);
    let mod_prefix = if mods.is_empty() {
        String::new()
    } else {
        format!("{} ", mods.join(" "))
    };
    let receiver = message_fields(fields, decl_field::RECEIVER_TYPE)
        .first()
        .map(|t| format!("{}.", render_type(t, strings, qnames)))
        .unwrap_or_default();
    let params = render_value_parameters(fields, strings, qnames);
    let return_type = message_fields(fields, decl_field::RETURN_TYPE)
        .first()
        .map(|t| render_type(t, strings, qnames))
        .unwrap_or_else(|| "Unit".to_string());

    out.push_str(indent);
    out.push_str(&format!(
        "{mod_prefix}fun {receiver}{name}({params}): {return_type} = error(\"stub\")\n"
    ));
}

fn emit_property(
    fields: &[Field],
    strings: &StringTable,
    qnames: &QualifiedNameTable,
    indent: &str,
    out: &mut String,
) {
    let visibility = varint_field(fields, decl_field::VISIBILITY).unwrap_or(VISIBILITY_PUBLIC);
    if !is_exported_visibility(visibility) {
        return;
    }
    let Some(name_index) = varint_field(fields, decl_field::NAME_INDEX) else { return };
    let name = strings.get(name_index).unwrap_or("unknown").to_string();
    let return_type = message_fields(fields, decl_field::RETURN_TYPE)
        .first()
        .map(|t| render_type(t, strings, qnames))
        .unwrap_or_else(|| "Any?".to_string());

    out.push_str(indent);
    out.push_str(&format!("val {name}: {return_type} get() = error(\"stub\")\n"));
}

/// Decodes one `linkdata/**/*.knm` fragment into a rendered stub source
/// body, or `None` if the fragment can't be parsed at all.
fn render_fragment(package_fqn: &str, bytes: &[u8]) -> Option<String> {
    let fields = parse_fields(bytes);
    let strings = StringTable(string_fields(&fields, field::STRING_TABLE));
    let qname_entries: Vec<(Option<u64>, u64)> = message_fields(&fields, field::QUALIFIED_NAME_TABLE)
        .iter()
        .map(|qn| {
            let parent = varint_field(qn, qname_field::PARENT_INDEX);
            let short = varint_field(qn, qname_field::SHORT_NAME_INDEX).unwrap_or(0);
            (parent, short)
        })
        .collect();
    let qnames = QualifiedNameTable { entries: qname_entries };

    let mut out = String::new();
    if !package_fqn.is_empty() {
        out.push_str(&format!("package {package_fqn}\n\n"));
    }
    for class in message_fields(&fields, field::CLASSES) {
        emit_class(&class, &strings, &qnames, "", &mut out, true);
    }
    for func in message_fields(&fields, field::FUNCTIONS) {
        emit_function(&func, &strings, &qnames, "", &mut out);
    }
    for prop in message_fields(&fields, field::PROPERTIES) {
        emit_property(&prop, &strings, &qnames, "", &mut out);
    }

    if out.trim().is_empty() {
        None
    } else {
        Some(out)
    }
}

fn package_fqn_from_entry_path(entry_path: &str) -> String {
    let dir = entry_path.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
    dir.strip_prefix("root_package/")
        .or_else(|| dir.strip_prefix("root_package"))
        .unwrap_or(dir)
        .trim_start_matches('/')
        .replace('/', ".")
}

/// Generates source stubs for every `linkdata/**/*.knm` fragment in the
/// klib, writing one file per package into a unique temp directory. Returns
/// `None` (no stubs) when the zip itself can't be read — the session is
/// still built without this library's stubs (§4.3 "Error handling").
pub fn generate_stubs(klib_path: &Path) -> Option<PathBuf> {
    let file = fs::File::open(klib_path)
        .map_err(|e| warn!(path = %klib_path.display(), error = %e, "failed to open klib"))
        .ok()?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| warn!(path = %klib_path.display(), error = %e, "failed to read klib as zip"))
        .ok()?;

    let dest_dir = tempfile::Builder::new()
        .prefix("klib-stubs-")
        .tempdir()
        .ok()?
        .into_path();

    let mut any_written = false;
    for i in 0..archive.len() {
        let Ok(mut entry) = archive.by_index(i) else { continue };
        let entry_path = entry.name().to_string();
        if !entry_path.contains("linkdata/") || !entry_path.ends_with(".knm") {
            continue;
        }
        let mut bytes = Vec::new();
        if entry.read_to_end(&mut bytes).is_err() {
            continue;
        }
        let package_fqn = package_fqn_from_entry_path(&entry_path);
        let Some(rendered) = render_fragment(&package_fqn, &bytes) else {
            continue;
        };
        let file_name = if package_fqn.is_empty() {
            "root.kt".to_string()
        } else {
            format!("{}.kt", package_fqn.replace('.', "_"))
        };
        if fs::write(dest_dir.join(file_name), rendered).is_ok() {
            any_written = true;
        }
    }

    if any_written {
        Some(dest_dir)
    } else {
        None
    }
}

/// Content hash used to make stub generation deterministic modulo the temp
/// directory name (§8 testable property 5).
pub fn content_hash(klib_path: &Path) -> Option<u64> {
    let bytes = fs::read(klib_path).ok()?;
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    Some(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if value == 0 {
                break;
            }
        }
    }

    fn encode_tag(tag: u64, wire_type: u8, out: &mut Vec<u8>) {
        encode_varint((tag << 3) | wire_type as u64, out);
    }

    fn encode_string_field(tag: u64, value: &str, out: &mut Vec<u8>) {
        encode_tag(tag, 2, out);
        encode_varint(value.len() as u64, out);
        out.extend_from_slice(value.as_bytes());
    }

    fn encode_varint_field(tag: u64, value: u64, out: &mut Vec<u8>) {
        encode_tag(tag, 0, out);
        encode_varint(value, out);
    }

    fn encode_message_field(tag: u64, body: &[u8], out: &mut Vec<u8>) {
        encode_tag(tag, 2, out);
        encode_varint(body.len() as u64, out);
        out.extend_from_slice(body);
    }

    #[test]
    fn package_fqn_strips_root_package_sentinel_and_converts_separators() {
        assert_eq!(
            package_fqn_from_entry_path("linkdata/root_package/com/example/0_foo.knm"),
            "com.example"
        );
        assert_eq!(package_fqn_from_entry_path("linkdata/root_package/0_foo.knm"), "");
    }

    #[test]
    fn renders_public_class_with_function_member() {
        // string table: ["Widget", "render", "String"]
        let mut buf = Vec::new();
        encode_string_field(field::STRING_TABLE, "Widget", &mut buf);
        encode_string_field(field::STRING_TABLE, "render", &mut buf);
        encode_string_field(field::STRING_TABLE, "String", &mut buf);

        // qualified-name table: entry 0 = {no parent, short=0} -> "Widget"
        let mut qname0 = Vec::new();
        encode_varint_field(qname_field::SHORT_NAME_INDEX, 0, &mut qname0);
        encode_message_field(field::QUALIFIED_NAME_TABLE, &qname0, &mut buf);

        // return type for render(): String -> qname index 2? We only have one
        // qname entry (index 0), so point return type name_index at string 2
        // directly via a second qname entry.
        let mut qname1 = Vec::new();
        encode_varint_field(qname_field::SHORT_NAME_INDEX, 2, &mut qname1);
        encode_message_field(field::QUALIFIED_NAME_TABLE, &qname1, &mut buf);

        let mut return_type = Vec::new();
        encode_varint_field(type_field::NAME_INDEX, 1, &mut return_type);

        let mut function = Vec::new();
        encode_varint_field(decl_field::VISIBILITY, VISIBILITY_PUBLIC, &mut function);
        encode_varint_field(decl_field::NAME_INDEX, 1, &mut function);
        encode_message_field(decl_field::RETURN_TYPE, &return_type, &mut function);

        let mut class_body = Vec::new();
        encode_varint_field(decl_field::VISIBILITY, VISIBILITY_PUBLIC, &mut class_body);
        encode_varint_field(decl_field::NAME_INDEX, 0, &mut class_body);
        encode_varint_field(decl_field::CLASS_KIND, CLASS_KIND_CLASS, &mut class_body);
        encode_message_field(decl_field::MEMBER_FUNCTIONS, &function, &mut class_body);

        encode_message_field(field::CLASSES, &class_body, &mut buf);

        let rendered = render_fragment("com.example", &buf).expect("should render");
        assert!(rendered.contains("package com.example"));
        assert!(rendered.contains("class Widget"));
        assert!(rendered.contains("fun render(): String"));
    }

    #[test]
    fn private_visibility_is_not_emitted() {
        let mut buf = Vec::new();
        encode_string_field(field::STRING_TABLE, "Hidden", &mut buf);
        let mut class_body = Vec::new();
        encode_varint_field(decl_field::VISIBILITY, 99, &mut class_body); // not public/protected
        encode_varint_field(decl_field::NAME_INDEX, 0, &mut class_body);
        encode_message_field(field::CLASSES, &class_body, &mut buf);

        assert!(render_fragment("pkg", &buf).is_none());
    }

    #[test]
    fn garbage_bytes_do_not_panic_and_yield_none() {
        let garbage = vec![0xffu8; 32];
        assert!(render_fragment("pkg", &garbage).is_none());
    }

    #[test]
    fn generate_stubs_returns_none_for_unreadable_zip() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("broken.klib");
        fs::write(&bogus, b"not a zip").unwrap();
        assert!(generate_stubs(&bogus).is_none());
    }

    #[test]
    fn content_hash_is_stable_for_same_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.klib");
        fs::write(&path, b"abc123").unwrap();
        assert_eq!(content_hash(&path), content_hash(&path));
    }
}
