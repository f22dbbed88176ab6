//! OMF linked-data emission.
//!
//! Each reading becomes a run of OMF records: a `FledgeAsset` value record
//! the first time an asset is seen, a `__Link` record the first time an
//! asset/datapoint pair is seen, and a value record for every datapoint.
//! Container definitions accumulate separately and are flushed to the
//! types endpoint before the value batch. The memoisation tables live for
//! the emitter instance, which matches one north connection; a connection
//! reset or a remote schema loss requires [`OmfLinkedData::clear`].

use std::collections::{HashMap, HashSet};

use crate::lazyjson::LazyJson;
use crate::model::{DatapointValue, Reading};

use super::sender::Sender;

/// Reserved datapoint name carrying per-reading hints; never forwarded.
pub const OMF_HINT: &str = "OMFHint";

/// Hints modifying how a reading is emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OmfHint {
    TagName(String),
    Tag(String),
}

/// Hints parsed from the reserved `OMFHint` datapoint.
#[derive(Debug, Clone, Default)]
pub struct OmfHints {
    hints: Vec<OmfHint>,
}

impl OmfHints {
    /// Walk the hint document for the keys we honour. Unknown keys are
    /// ignored so south plugins can carry hints for other layers.
    pub fn parse(doc: &str) -> Self {
        let json = LazyJson::new(doc);
        let mut hints = Vec::new();
        if let Some(cursor) = json.attribute("tagName") {
            if let Some(value) = json.string(cursor) {
                hints.push(OmfHint::TagName(value));
            }
        }
        if let Some(cursor) = json.attribute("tag") {
            if let Some(value) = json.string(cursor) {
                hints.push(OmfHint::Tag(value));
            }
        }
        Self { hints }
    }

    pub fn is_empty(&self) -> bool {
        self.hints.is_empty()
    }

    /// The asset name override, when a tag hint is present. The last hint
    /// wins.
    pub fn asset_override(&self) -> Option<&str> {
        self.hints.iter().rev().find_map(|hint| match hint {
            OmfHint::TagName(name) | OmfHint::Tag(name) => Some(name.as_str()),
        })
    }
}

/// The linked-data emitter with its per-connection memoisation tables.
#[derive(Default)]
pub struct OmfLinkedData {
    asset_sent: HashSet<String>,
    /// link name → base type, so repeat datapoints reuse the decision
    container_sent: HashMap<String, String>,
    link_sent: HashSet<String>,
    containers: String,
}

impl OmfLinkedData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the payload fragment for one reading. Records are comma
    /// separated; the caller wraps the batch in `[...]`.
    pub fn process_reading(
        &mut self,
        reading: &Reading,
        _prefix: &str,
        hints: Option<&OmfHints>,
    ) -> String {
        let mut asset_name = reading.asset_code.clone();
        if let Some(name) = hints.and_then(OmfHints::asset_override) {
            tracing::info!("Using OMF tag hint: {}", name);
            asset_name = name.to_string();
        }

        let mut records: Vec<String> = Vec::new();
        if !self.asset_sent.contains(&asset_name) {
            records.push(format!(
                "{{ \"typeid\":\"FledgeAsset\", \"values\":[ {{ \"AssetId\":\"{a}\", \"Name\":\"{a}\" }} ] }}",
                a = asset_name
            ));
            self.asset_sent.insert(asset_name.clone());
        }

        let time = format!("{}Z", reading.user_ts_standard());
        for dp in &reading.datapoints {
            if dp.name == OMF_HINT {
                continue;
            }
            let Some(base_type) = base_type(&dp.value) else {
                // Unsupported type, nothing is emitted for this datapoint
                continue;
            };
            let link = format!("{}_{}", asset_name, dp.name);
            if !self.container_sent.contains_key(&link) {
                self.append_container(&link, &dp.name, base_type);
                self.container_sent
                    .insert(link.clone(), base_type.to_string());
            }
            if !self.link_sent.contains(&link) {
                records.push(format!(
                    "{{ \"typeid\":\"__Link\", \"values\":[ {{ \"source\": {{ \"typeid\": \"FledgeAsset\", \"index\":\"{asset}\" }}, \"target\": {{ \"containerid\": \"{link}\" }} }} ] }}",
                    asset = asset_name,
                    link = link
                ));
                self.link_sent.insert(link.clone());
            }
            records.push(format!(
                "{{\"containerid\": \"{link}\", \"values\": [{{\"{base}\": {value}, \"Time\": \"{time}\"}}]}}",
                link = link,
                base = base_type,
                value = dp.value,
                time = time
            ));
        }
        records.join(",")
    }

    fn append_container(&mut self, link: &str, name: &str, base_type: &str) {
        let container = format!(
            "{{ \"id\" : \"{link}\", \"typeid\" : \"{base}\", \"name\" : \"{name}\", \"datasource\" : \"Fledge\" }}",
            link = link,
            base = base_type,
            name = name
        );
        tracing::debug!("Built container: {}", container);
        if !self.containers.is_empty() {
            self.containers.push(',');
        }
        self.containers.push_str(&container);
    }

    /// Whether container definitions are waiting to be flushed.
    pub fn has_pending_containers(&self) -> bool {
        !self.containers.is_empty()
    }

    /// POST the accumulated container definitions. An empty buffer is a
    /// success. HTTP 400 is non-fatal for the caller's value batch in
    /// principle, but still reported as false so the caller decides.
    pub fn flush_containers(
        &mut self,
        sender: &mut dyn Sender,
        path: &str,
        headers: &[(String, String)],
    ) -> bool {
        if self.containers.is_empty() {
            return true;
        }
        let payload = format!("[{}]", self.containers);
        self.containers.clear();
        tracing::debug!("Flush container information: {}", payload);
        match sender.send("POST", path, headers, &payload) {
            Ok((status, _)) if (200..300).contains(&status) => true,
            Ok((400, body)) => {
                tracing::warn!(
                    "Sending containers, not blocking issue: {} - {}",
                    body,
                    path
                );
                false
            }
            Ok((status, _)) => {
                tracing::error!("Sending containers, HTTP code {} - {}", status, path);
                false
            }
            Err(e) => {
                tracing::error!("Sending containers, {} - {}", e, path);
                false
            }
        }
    }

    /// Forget everything sent on this connection. Required when the
    /// connection is torn down or the remote signals schema loss.
    pub fn clear(&mut self) {
        self.asset_sent.clear();
        self.container_sent.clear();
        self.link_sent.clear();
        self.containers.clear();
    }
}

/// OMF base type for a datapoint value; unsupported types emit nothing.
fn base_type(value: &DatapointValue) -> Option<&'static str> {
    match value {
        DatapointValue::Str(_) => Some("String"),
        DatapointValue::Integer(_) | DatapointValue::Float(_) => Some("Double"),
        _ => None,
    }
}
