//! Plist helpers shared across the crate

use std::io::BufWriter;

pub fn plist_to_xml_bytes(p: &plist::Dictionary) -> Vec<u8> {
    let buf = Vec::new();
    let mut writer = BufWriter::new(buf);
    plist::to_writer_xml(&mut writer, &p).unwrap();

    writer.into_inner().unwrap()
}

/// Renders a dictionary as XML for debug logging, eliding data blobs.
pub fn pretty_print_dictionary(dict: &plist::Dictionary) -> String {
    pretty_print_plist(&plist::Value::Dictionary(dict.clone()))
}

/// Renders a plist value as XML for debug logging, eliding data blobs.
pub fn pretty_print_plist(value: &plist::Value) -> String {
    let mut elided = value.clone();
    elide_data(&mut elided);
    let buf = Vec::new();
    let mut writer = BufWriter::new(buf);
    if plist::to_writer_xml(&mut writer, &elided).is_err() {
        return "<unprintable plist>".to_string();
    }
    match writer.into_inner() {
        Ok(b) => String::from_utf8_lossy(&b).to_string(),
        Err(_) => "<unprintable plist>".to_string(),
    }
}

fn elide_data(value: &mut plist::Value) {
    match value {
        plist::Value::Data(d) => {
            let summary = format!("<{} bytes>", d.len());
            *value = plist::Value::String(summary);
        }
        plist::Value::Array(arr) => {
            for item in arr.iter_mut() {
                elide_data(item);
            }
        }
        plist::Value::Dictionary(dict) => {
            for (_, v) in dict.iter_mut() {
                elide_data(v);
            }
        }
        _ => {}
    }
}

pub(crate) fn dict_get_bool(dict: &plist::Dictionary, key: &str) -> bool {
    dict.get(key).and_then(|v| v.as_boolean()).unwrap_or(false)
}

pub(crate) fn dict_get_uint(dict: &plist::Dictionary, key: &str) -> Option<u64> {
    dict.get(key).and_then(|v| v.as_unsigned_integer())
}

pub(crate) fn dict_get_string<'a>(dict: &'a plist::Dictionary, key: &str) -> Option<&'a str> {
    dict.get(key).and_then(|v| v.as_string())
}

pub(crate) fn dict_get_data<'a>(dict: &'a plist::Dictionary, key: &str) -> Option<&'a [u8]> {
    dict.get(key).and_then(|v| v.as_data())
}

pub(crate) fn dict_get_dict<'a>(
    dict: &'a plist::Dictionary,
    key: &str,
) -> Option<&'a plist::Dictionary> {
    dict.get(key).and_then(|v| v.as_dictionary())
}

/// Walks a chain of nested dictionary keys, like `plist_access_path`.
pub(crate) fn dict_get_path<'a>(
    dict: &'a plist::Dictionary,
    path: &[&str],
) -> Option<&'a plist::Value> {
    let (first, rest) = path.split_first()?;
    let mut node = dict.get(first)?;
    for key in rest {
        node = node.as_dictionary()?.get(key)?;
    }
    Some(node)
}

/// Copies `src_key` from one dictionary into another under `dst_key`,
/// keeping the value as-is. Missing sources are ignored.
pub(crate) fn dict_copy_item(
    dst: &mut plist::Dictionary,
    dst_key: &str,
    src: &plist::Dictionary,
    src_key: &str,
) {
    if let Some(v) = src.get(src_key) {
        dst.insert(dst_key.into(), v.clone());
    }
}

/// Merges every entry of `src` into `dst`, overwriting existing keys.
pub(crate) fn dict_merge(dst: &mut plist::Dictionary, src: &plist::Dictionary) {
    for (k, v) in src.iter() {
        dst.insert(k.clone(), v.clone());
    }
}
