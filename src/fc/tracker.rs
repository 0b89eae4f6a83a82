use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::fc::signature_cache::SignatureCache;
use crate::util::generated_call_id;

/// A tool call accepted in the current decode pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub name: String,
    pub args: serde_json::Value,
    pub signature: Option<String>,
    pub session_id: Option<String>,
}

/// Per-pass identity and dedupe for tool calls arriving through the
/// structured channel and the inline-tag channel.
pub struct ToolCallTracker {
    signatures: Arc<SignatureCache>,
    session_id: Option<String>,
    /// call id -> name for every emitted call.
    emitted_ids: FxHashMap<String, String>,
    /// (name, canonical args) for every emitted call.
    fingerprints: FxHashSet<(String, String)>,
    /// (name, canonical args) for calls that arrived without a backend id.
    idless_fingerprints: FxHashSet<(String, String)>,
    last_thinking_signature: Option<String>,
}

impl ToolCallTracker {
    #[must_use]
    pub fn new(signatures: Arc<SignatureCache>, session_id: Option<String>) -> Self {
        Self {
            signatures,
            session_id,
            emitted_ids: FxHashMap::default(),
            fingerprints: FxHashSet::default(),
            idless_fingerprints: FxHashSet::default(),
            last_thinking_signature: None,
        }
    }

    /// Remember the most recent thinking signature; the next call arriving
    /// without its own signature inherits it.
    pub fn note_thinking_signature(&mut self, signature: &str) {
        if !signature.is_empty() {
            self.last_thinking_signature = Some(signature.to_string());
        }
    }

    /// Accept a call, returning `None` when it duplicates one already
    /// emitted in this pass.
    pub fn observe(
        &mut self,
        name: &str,
        backend_id: Option<&str>,
        args: serde_json::Value,
        signature: Option<&str>,
    ) -> Option<ToolCallRecord> {
        let fingerprint = (name.to_string(), canonical_json(&args));
        let backend_id = backend_id.filter(|id| !id.is_empty());

        let call_id = match backend_id {
            Some(id) => {
                if self.emitted_ids.get(id).is_some_and(|seen| seen == name)
                    || self.idless_fingerprints.contains(&fingerprint)
                {
                    tracing::debug!(call_id = %id, name = %name, "suppressing duplicate tool call");
                    return None;
                }
                if self.emitted_ids.contains_key(id) {
                    let fresh = generated_call_id();
                    tracing::warn!(
                        call_id = %id,
                        replacement = %fresh,
                        name = %name,
                        "backend reused a call id for a different tool; assigning a new id"
                    );
                    fresh
                } else {
                    id.to_string()
                }
            }
            None => {
                if self.fingerprints.contains(&fingerprint) {
                    tracing::debug!(name = %name, "suppressing duplicate tool call without id");
                    return None;
                }
                self.idless_fingerprints.insert(fingerprint.clone());
                generated_call_id()
            }
        };

        let signature = signature
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| self.last_thinking_signature.take());
        if let Some(signature) = signature.as_deref() {
            self.signatures
                .store(&call_id, self.session_id.as_deref(), signature);
        }

        self.emitted_ids.insert(call_id.clone(), name.to_string());
        self.fingerprints.insert(fingerprint);

        Some(ToolCallRecord {
            call_id,
            name: name.to_string(),
            args,
            signature,
            session_id: self.session_id.clone(),
        })
    }

    #[must_use]
    pub fn emitted_count(&self) -> usize {
        self.emitted_ids.len()
    }
}

/// JSON text with object keys sorted at every level.
fn canonical_json(value: &serde_json::Value) -> String {
    fn write(value: &serde_json::Value, out: &mut String) {
        match value {
            serde_json::Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (idx, key) in keys.into_iter().enumerate() {
                    if idx > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::Value::String(key.clone()).to_string());
                    out.push(':');
                    if let Some(child) = map.get(key) {
                        write(child, out);
                    }
                }
                out.push('}');
            }
            serde_json::Value::Array(items) => {
                out.push('[');
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }

    let mut out = String::new();
    write(value, &mut out);
    out
}
