//! Carrier abstractions
//!
//! Propagation reads and writes headers through two narrow traits so
//! any header-shaped container can participate: HTTP header maps,
//! message attributes, or plain hash maps in tests.

use std::collections::HashMap;

/// Read side of a carrier: iterate key/value pairs.
pub trait TextMapReader {
    /// Visit every entry until the visitor returns false.
    fn for_each(&self, visit: &mut dyn FnMut(&str, &str) -> bool);

    /// Case-insensitive single-key lookup.
    fn get(&self, key: &str) -> Option<String> {
        let mut found = None;
        self.for_each(&mut |k, v| {
            if k.eq_ignore_ascii_case(key) {
                found = Some(v.to_string());
                false
            } else {
                true
            }
        });
        found
    }
}

/// Write side of a carrier.
pub trait TextMapWriter {
    fn set(&mut self, key: &str, value: &str);
}

impl TextMapReader for HashMap<String, String> {
    fn for_each(&self, visit: &mut dyn FnMut(&str, &str) -> bool) {
        for (k, v) in self.iter() {
            if !visit(k, v) {
                break;
            }
        }
    }
}

impl TextMapWriter for HashMap<String, String> {
    fn set(&mut self, key: &str, value: &str) {
        self.insert(key.to_string(), value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashmap_carrier_case_insensitive_get() {
        let mut carrier = HashMap::new();
        carrier.set("X-Datadog-Trace-Id", "42");
        assert_eq!(
            TextMapReader::get(&carrier, "x-datadog-trace-id").as_deref(),
            Some("42")
        );
        assert_eq!(TextMapReader::get(&carrier, "missing"), None);
    }
}
