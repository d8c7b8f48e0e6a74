//! Parsers for Nagios config and object files
//!
//! These read files generated *by* Nagios, such as `objects.cache` or
//! `status.dat`, to seed which tests the engine runs. Two record shapes
//! exist: `define <type> { key value ... }` and
//! `<type>status { key=value ... }`. The parsers are external-interface
//! consumers only; they never participate in the runtime loop.

use regex::Regex;
use shared::ProbeError;
use std::collections::HashMap;
use std::path::Path;

/// Parses a given object file for the requested record types.
///
/// An empty `object_types` keeps every type. `object_select` maps a key
/// to the values it must have: a record whose key carries any other
/// value is discarded when its closing brace is reached.
#[derive(Debug, Default)]
pub struct ObjectParser {
    objects: HashMap<String, Vec<HashMap<String, String>>>,
}

impl ObjectParser {
    pub fn parse_file(
        path: &Path,
        object_types: &[&str],
        object_select: &HashMap<String, Vec<String>>,
    ) -> shared::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            ProbeError::Config(format!(
                "Failed to read object file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self::parse(&content, object_types, object_select))
    }

    pub fn parse(
        content: &str,
        object_types: &[&str],
        object_select: &HashMap<String, Vec<String>>,
    ) -> Self {
        let mut objects: HashMap<String, Vec<HashMap<String, String>>> = HashMap::new();
        for object_type in object_types {
            objects.insert((*object_type).to_string(), Vec::new());
        }

        // The record being accumulated, if any, and the key/value
        // splitter of the current record shape.
        let mut current: Option<(String, HashMap<String, String>)> = None;
        let mut splitter: Option<char> = None;

        for raw_line in content.lines() {
            let line = raw_line.trim();

            if current.is_none() {
                let header = if let Some(rest) = line.strip_prefix("define ") {
                    rest.strip_suffix('{')
                        .map(|object_type| (object_type.trim().to_string(), None))
                } else {
                    line.strip_suffix("status {")
                        .map(|object_type| (object_type.trim().to_string(), Some('=')))
                };

                // Blank and unknown lines outside a record are skipped.
                let Some((object_type, split)) = header else {
                    continue;
                };
                if object_type.is_empty() {
                    continue;
                }
                if !object_types.is_empty() && !object_types.contains(&object_type.as_str()) {
                    continue;
                }

                splitter = split;
                current = Some((object_type, HashMap::new()));
            } else if line == "}" {
                if let Some((object_type, object)) = current.take() {
                    objects.entry(object_type).or_default().push(object);
                }
            } else {
                let (key, value) = match splitter {
                    Some(sep) => line.split_once(sep).unwrap_or((line, "")),
                    None => line.split_once(char::is_whitespace).unwrap_or((line, "")),
                };
                let key = key.to_string();
                let value = value.trim_start().to_string();

                if let Some(allowed) = object_select.get(&key) {
                    if !allowed.iter().any(|candidate| candidate == &value) {
                        // Selector mismatch: drop the record in progress.
                        current = None;
                        continue;
                    }
                }

                if let Some((_, object)) = current.as_mut() {
                    object.insert(key, value);
                }
            }
        }

        Self { objects }
    }

    /// Records of the given type, empty if none were found.
    pub fn get(&self, object_type: &str) -> &[HashMap<String, String>] {
        self.objects
            .get(object_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains(&self, object_type: &str) -> bool {
        self.objects.contains_key(object_type)
    }

    /// The record types present, including pre-requested empty ones.
    pub fn types(&self) -> Vec<&str> {
        self.objects.keys().map(String::as_str).collect()
    }
}

/// Parser for the main Nagios config file (`nagios.cfg`).
///
/// One `key = value` attribute per line; the last occurrence of a key
/// wins.
#[derive(Debug, Default)]
pub struct ConfigParser {
    config: HashMap<String, String>,
}

impl ConfigParser {
    pub fn parse_file(path: &Path) -> shared::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            ProbeError::Config(format!(
                "Failed to read config file {}: {err}",
                path.display()
            ))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> shared::Result<Self> {
        let attr = Regex::new(r"^(\w+)\s*=\s*(.*)$")?;

        let mut config = HashMap::new();
        for raw_line in content.lines() {
            if let Some(caps) = attr.captures(raw_line.trim()) {
                config.insert(caps[1].to_string(), caps[2].to_string());
            }
        }

        Ok(Self { config })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.config.contains_key(key)
    }

    pub fn keys(&self) -> Vec<&str> {
        self.config.keys().map(String::as_str).collect()
    }
}
