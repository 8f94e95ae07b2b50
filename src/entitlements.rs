// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Code entitlements handling.

Entitlements travel in two SuperBlob slots: an XML plist and a DER
encoding of the same dictionary. The DER form is carried opaquely by
[crate::embedded_signature::EntitlementsDerBlob]; this module handles the
plist side and the signature settings derived from well-known keys.
*/

use {
    crate::{code_directory::ExecutableSegmentFlags, error::MachoIntrospectError},
    std::io::Cursor,
};

/// Parse an entitlements XML plist string into a [plist::Value].
pub fn parse_entitlements_plist(xml: &str) -> Result<plist::Value, MachoIntrospectError> {
    plist::Value::from_reader_xml(Cursor::new(xml.as_bytes()))
        .map_err(MachoIntrospectError::PlistParseXml)
}

/// Serialize an entitlements plist value back to XML.
pub fn entitlements_plist_to_xml(value: &plist::Value) -> Result<Vec<u8>, MachoIntrospectError> {
    let mut buffer = Vec::new();

    value
        .to_writer_xml(&mut buffer)
        .map_err(MachoIntrospectError::PlistSerializeXml)?;

    // Apple's XML writer terminates with a newline.
    buffer.push(b'\n');

    Ok(buffer)
}

/// Convert an entitlements plist to executable segment flags.
///
/// Some entitlements imply features of the executable segment. The
/// mapping here mirrors what Apple's signing tooling derives.
pub fn plist_to_executable_segment_flags(value: &plist::Value) -> ExecutableSegmentFlags {
    let mut flags = ExecutableSegmentFlags::empty();

    if let Some(d) = value.as_dictionary() {
        if matches!(d.get("get-task-allow"), Some(plist::Value::Boolean(true))) {
            flags |= ExecutableSegmentFlags::ALLOW_UNSIGNED;
        }
        if matches!(
            d.get("run-unsigned-code"),
            Some(plist::Value::Boolean(true))
        ) {
            flags |= ExecutableSegmentFlags::ALLOW_UNSIGNED;
        }
        if matches!(
            d.get("com.apple.private.cs.debugger"),
            Some(plist::Value::Boolean(true))
        ) {
            flags |= ExecutableSegmentFlags::DEBUGGER;
        }
        if matches!(
            d.get("dynamic-codesigning"),
            Some(plist::Value::Boolean(true))
        ) {
            flags |= ExecutableSegmentFlags::JIT;
        }
        if matches!(
            d.get("com.apple.private.skip-library-validation"),
            Some(plist::Value::Boolean(true))
        ) {
            flags |= ExecutableSegmentFlags::SKIP_LIBRARY_VALIDATION;
        }
    }

    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>get-task-allow</key>
    <true/>
    <key>com.apple.security.app-sandbox</key>
    <false/>
</dict>
</plist>
"#;

    #[test]
    fn parse_and_reencode() {
        let value = parse_entitlements_plist(SAMPLE).unwrap();

        let dict = value.as_dictionary().unwrap();
        assert_eq!(dict.get("get-task-allow"), Some(&plist::Value::Boolean(true)));

        let xml = entitlements_plist_to_xml(&value).unwrap();
        let reparsed =
            parse_entitlements_plist(std::str::from_utf8(&xml).unwrap()).unwrap();

        assert_eq!(value, reparsed);
    }

    #[test]
    fn exec_seg_flags_from_entitlements() {
        let value = parse_entitlements_plist(SAMPLE).unwrap();

        assert_eq!(
            plist_to_executable_segment_flags(&value),
            ExecutableSegmentFlags::ALLOW_UNSIGNED
        );

        let mut d = plist::Dictionary::new();
        d.insert("dynamic-codesigning".into(), plist::Value::Boolean(true));
        assert_eq!(
            plist_to_executable_segment_flags(&plist::Value::Dictionary(d)),
            ExecutableSegmentFlags::JIT
        );

        assert_eq!(
            plist_to_executable_segment_flags(&plist::Value::Boolean(true)),
            ExecutableSegmentFlags::empty()
        );
    }
}
