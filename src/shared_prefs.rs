//! `SharedPreferences` XML file adapter.
//!
//! The companion app stores its settings with `Context.getSharedPreferences`,
//! which persists a flat XML document:
//!
//! ```xml
//! <?xml version='1.0' encoding='utf-8' standalone='yes' ?>
//! <map>
//!     <boolean name="is_playing" value="true" />
//!     <long name="altitude" value="4638179850610278400" />
//!     <float name="speed" value="3.5" />
//!     <string name="last_clicked_location">{"latitude":1.0,"longitude":2.0}</string>
//! </map>
//! ```
//!
//! Android writes a new file on every commit and keeps `<name>.bak` around
//! while it does. When the backup exists the main file may be half written, so
//! the backup is read instead.

use std::borrow::Cow;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use log::trace;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::prefs::{ConfigurationSource, PrefMap, PrefValue, PrefsError};

pub const DEFAULT_PREFS_PATH: &str = "/data/data/com.dvhamham/shared_prefs/gps_rider_prefs.xml";

fn xml_error(e: impl std::fmt::Display) -> PrefsError {
    PrefsError::Xml(e.to_string())
}

fn name_attr(element: &BytesStart<'_>) -> Result<String, PrefsError> {
    let attr = element
        .try_get_attribute("name")
        .map_err(xml_error)?
        .ok_or_else(|| {
            xml_error(format!(
                "<{}> without a name",
                String::from_utf8_lossy(element.name().as_ref())
            ))
        })?;
    Ok(attr.unescape_value().map_err(xml_error)?.into_owned())
}

fn value_attr<'a>(element: &'a BytesStart<'_>, key: &str) -> Result<Cow<'a, str>, PrefsError> {
    let attr = element
        .try_get_attribute("value")
        .map_err(xml_error)?
        .ok_or_else(|| xml_error(format!("`{key}` has no value")))?;
    attr.unescape_value().map_err(xml_error)
}

fn scalar_entry(element: &BytesStart<'_>) -> Result<(String, PrefValue), PrefsError> {
    let key = name_attr(element)?;
    let raw = value_attr(element, &key)?;
    let bad = || PrefsError::BadValue {
        key: key.clone(),
        value: raw.to_string(),
    };

    let value = match element.name().as_ref() {
        b"boolean" => match raw.as_ref() {
            "true" => PrefValue::Bool(true),
            "false" => PrefValue::Bool(false),
            _ => return Err(bad()),
        },
        b"int" => PrefValue::Int(raw.parse().map_err(|_| bad())?),
        b"long" => PrefValue::Long(raw.parse().map_err(|_| bad())?),
        b"float" => PrefValue::Float(raw.parse().map_err(|_| bad())?),
        other => {
            return Err(xml_error(format!(
                "unexpected element <{}>",
                String::from_utf8_lossy(other)
            )))
        }
    };
    Ok((key, value))
}

/// Parses a whole preference document. A document without a closed `<map>`
/// is treated as truncated.
pub fn parse_shared_prefs(xml: &str) -> Result<PrefMap, PrefsError> {
    let mut reader = Reader::from_str(xml);
    let mut map = PrefMap::new();

    let mut map_open = false;
    let mut map_closed = false;
    // Members of <set> entries are ignored, nothing here reads string sets.
    let mut set_depth = 0usize;
    let mut open_string: Option<(String, String)> = None;

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => match e.name().as_ref() {
                b"map" => map_open = true,
                b"set" => set_depth += 1,
                b"string" if set_depth > 0 => {}
                b"string" => open_string = Some((name_attr(&e)?, String::new())),
                other => {
                    return Err(xml_error(format!(
                        "unexpected element <{}>",
                        String::from_utf8_lossy(other)
                    )))
                }
            },
            Event::Empty(e) => match e.name().as_ref() {
                b"map" => {
                    map_open = true;
                    map_closed = true;
                }
                b"set" | b"null" => {}
                b"string" if set_depth > 0 => {}
                b"string" => {
                    map.insert(name_attr(&e)?, PrefValue::String(String::new()));
                }
                _ => {
                    let (key, value) = scalar_entry(&e)?;
                    map.insert(key, value);
                }
            },
            Event::Text(text) => {
                if let Some((_, buf)) = open_string.as_mut() {
                    buf.push_str(&text.unescape().map_err(xml_error)?);
                }
            }
            Event::CData(data) => {
                if let Some((_, buf)) = open_string.as_mut() {
                    buf.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"map" => map_closed = true,
                b"set" => set_depth = set_depth.saturating_sub(1),
                b"string" if set_depth == 0 => {
                    if let Some((key, value)) = open_string.take() {
                        map.insert(key, PrefValue::String(value));
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    if !map_open || !map_closed || open_string.is_some() {
        return Err(xml_error("document ends before </map>"));
    }
    Ok(map)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    from_backup: bool,
    inode: u64,
    len: u64,
    mtime: i64,
    mtime_nsec: i64,
}

/// Preference file on disk, re-parsed only when its inode, size or mtime
/// changes.
pub struct SharedPrefsFile {
    path: PathBuf,
    backup: PathBuf,
    cache: Mutex<Option<(FileStamp, Arc<PrefMap>)>>,
}

impl SharedPrefsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut backup = path.clone().into_os_string();
        backup.push(".bak");
        Self {
            path,
            backup: PathBuf::from(backup),
            cache: Mutex::new(None),
        }
    }

    fn current_file(&self) -> (&Path, bool) {
        if self.backup.exists() {
            (&self.backup, true)
        } else {
            (&self.path, false)
        }
    }
}

impl ConfigurationSource for SharedPrefsFile {
    fn load(&self) -> Result<Arc<PrefMap>, PrefsError> {
        let (path, from_backup) = self.current_file();
        let io_error = |source| PrefsError::Io {
            path: path.to_path_buf(),
            source,
        };

        let meta = fs::metadata(path).map_err(io_error)?;
        let stamp = FileStamp {
            from_backup,
            inode: meta.ino(),
            len: meta.size(),
            mtime: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
        };

        {
            let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some((cached_stamp, map)) = &*cache {
                if *cached_stamp == stamp {
                    return Ok(Arc::clone(map));
                }
            }
        }

        let content = fs::read_to_string(path).map_err(io_error)?;
        let map = Arc::new(parse_shared_prefs(&content)?);
        trace!("Parsed {} preference entries from {}", map.len(), path.display());

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        *cache = Some((stamp, Arc::clone(&map)));
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefs::{encode_double, keys, PreferenceReader, PreferenceSnapshot, SnapshotStore};

    const SAMPLE: &str = r#"<?xml version='1.0' encoding='utf-8' standalone='yes' ?>
<map>
    <boolean name="is_playing" value="true" />
    <string name="last_clicked_location">{&quot;latitude&quot;:40.7128,&quot;longitude&quot;:-74.006}</string>
    <boolean name="use_altitude" value="true" />
    <long name="altitude" value="4638179850610278400" />
    <float name="speed" value="3.5" />
    <int name="unrelated" value="7" />
    <set name="history">
        <string>a</string>
        <string>b</string>
    </set>
    <string name="empty" />
</map>
"#;

    #[test]
    fn test_parse_sample_document() {
        let map = parse_shared_prefs(SAMPLE).unwrap();
        assert_eq!(map.get(keys::IS_PLAYING), Some(&PrefValue::Bool(true)));
        assert_eq!(map.get(keys::SPEED), Some(&PrefValue::Float(3.5)));
        assert_eq!(map.get("unrelated"), Some(&PrefValue::Int(7)));
        assert_eq!(map.get("empty"), Some(&PrefValue::String(String::new())));
        assert!(!map.contains_key("history"));

        let snapshot = PreferenceSnapshot::from_map(&map).unwrap();
        assert_eq!(snapshot.altitude.active(), Some(120.5));
        assert_eq!(snapshot.base_coordinate().latitude, 40.7128);
        assert_eq!(snapshot.base_coordinate().longitude, -74.006);
    }

    #[test]
    fn test_altitude_constant_is_encoded_double() {
        assert_eq!(encode_double(120.5), 4638179850610278400);
    }

    #[test]
    fn test_java_float_spellings() {
        let xml = r#"<map>
            <float name="a" value="1.0E-5" />
            <float name="b" value="-Infinity" />
            <float name="c" value="NaN" />
        </map>"#;
        let map = parse_shared_prefs(xml).unwrap();
        assert_eq!(map.get("a"), Some(&PrefValue::Float(1.0e-5)));
        assert_eq!(map.get("b"), Some(&PrefValue::Float(f32::NEG_INFINITY)));
        assert!(matches!(map.get("c"), Some(PrefValue::Float(v)) if v.is_nan()));
    }

    #[test]
    fn test_empty_map_element() {
        assert!(parse_shared_prefs("<map />").unwrap().is_empty());
    }

    #[test]
    fn test_truncated_document_is_rejected() {
        let cut = &SAMPLE[..SAMPLE.find("<float").unwrap()];
        assert!(parse_shared_prefs(cut).is_err());
        assert!(parse_shared_prefs("").is_err());
    }

    #[test]
    fn test_bad_scalar_is_rejected() {
        let xml = r#"<map><long name="altitude" value="12.5" /></map>"#;
        assert!(matches!(
            parse_shared_prefs(xml),
            Err(PrefsError::BadValue { .. })
        ));
        let xml = r#"<map><boolean name="is_playing" value="maybe" /></map>"#;
        assert!(parse_shared_prefs(xml).is_err());
    }

    #[test]
    fn test_file_source_reads_and_refreshes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gps_rider_prefs.xml");
        fs::write(&path, SAMPLE).unwrap();

        let store = SnapshotStore::new(SharedPrefsFile::new(&path));
        assert!(store.reload().is_playing);

        // Android replaces the file on commit, which yields a new inode.
        let stopped = SAMPLE.replace(
            r#"<boolean name="is_playing" value="true" />"#,
            r#"<boolean name="is_playing" value="false" />"#,
        );
        let tmp = dir.path().join("next.xml");
        fs::write(&tmp, stopped).unwrap();
        fs::rename(&tmp, &path).unwrap();
        assert!(!store.reload().is_playing);
    }

    #[test]
    fn test_file_source_prefers_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gps_rider_prefs.xml");
        fs::write(&path, "<map><boolean name=\"is_pla").unwrap();
        fs::write(dir.path().join("gps_rider_prefs.xml.bak"), SAMPLE).unwrap();

        let source = SharedPrefsFile::new(&path);
        let map = source.load().unwrap();
        assert_eq!(map.get(keys::IS_PLAYING), Some(&PrefValue::Bool(true)));
    }

    #[test]
    fn test_missing_file_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gps_rider_prefs.xml");
        fs::write(&path, SAMPLE).unwrap();

        let store = SnapshotStore::new(SharedPrefsFile::new(&path));
        let good = store.reload();

        fs::remove_file(&path).unwrap();
        assert!(matches!(
            store.source().load(),
            Err(PrefsError::Io { .. })
        ));
        assert_eq!(store.reload(), good);

        fs::write(&path, "<map><boolean name=\"is_playing\" value=\"tru").unwrap();
        assert_eq!(store.reload(), good);
    }
}
