//! Call/response pairing pass run on encoded turns before transmission.

use rustc_hash::FxHashSet;

use crate::protocol::wire::{FunctionResponse, WireContent, WirePart};

/// What one balancing pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalanceReport {
    pub synthesized_responses: usize,
    pub converted_responses: usize,
    pub removed_responses: usize,
    pub reattached_signatures: usize,
    pub dropped_signatures: usize,
    pub removed_turns: usize,
}

impl BalanceReport {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug)]
struct CallSite {
    turn: usize,
    part: usize,
    id: Option<String>,
    name: String,
}

#[derive(Debug)]
struct ResponseSite {
    turn: usize,
    part: usize,
    id: Option<String>,
    name: String,
}

fn sites_match(call: &CallSite, response: &ResponseSite) -> bool {
    match (&call.id, &response.id) {
        (Some(call_id), Some(response_id)) => call_id == response_id,
        _ => call.name == response.name,
    }
}

fn has_payload(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Object(map) => !map.is_empty(),
        serde_json::Value::Array(items) => !items.is_empty(),
        serde_json::Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// Pair every function call with a function response, move stray
/// signatures onto function calls and drop empty turns. Idempotent.
pub fn balance_parts(contents: &mut Vec<WireContent>) -> BalanceReport {
    let mut report = BalanceReport::default();

    let mut calls = Vec::new();
    let mut responses = Vec::new();
    for (turn_idx, turn) in contents.iter().enumerate() {
        for (part_idx, part) in turn.parts.iter().enumerate() {
            match part {
                WirePart::FunctionCall { call, .. } => calls.push(CallSite {
                    turn: turn_idx,
                    part: part_idx,
                    id: call.id.clone(),
                    name: call.name.clone(),
                }),
                WirePart::FunctionResponse(response) => responses.push(ResponseSite {
                    turn: turn_idx,
                    part: part_idx,
                    id: response.id.clone(),
                    name: response.name.clone(),
                }),
                _ => {}
            }
        }
    }

    let mut consumed = vec![false; responses.len()];
    let mut unmatched_calls: Vec<&CallSite> = Vec::new();
    for call in &calls {
        let hit = responses
            .iter()
            .enumerate()
            .find(|(idx, response)| !consumed[*idx] && sites_match(call, response))
            .map(|(idx, _)| idx);
        match hit {
            Some(idx) => consumed[idx] = true,
            None => unmatched_calls.push(call),
        }
    }

    let mut removed: FxHashSet<(usize, usize)> = FxHashSet::default();
    for (response, _) in responses
        .iter()
        .zip(&consumed)
        .filter(|(_, consumed)| !**consumed)
    {
        let part = &mut contents[response.turn].parts[response.part];
        let WirePart::FunctionResponse(fr) = part else {
            continue;
        };
        if has_payload(&fr.response) {
            let text = serde_json::to_string(&fr.response).unwrap_or_default();
            tracing::debug!(name = %fr.name, "converting orphan function response to text");
            *part = WirePart::text(text);
            report.converted_responses += 1;
        } else {
            removed.insert((response.turn, response.part));
            report.removed_responses += 1;
        }
    }

    reattach_orphan_signatures(contents, &mut removed, &mut report);

    for call in unmatched_calls {
        tracing::debug!(name = %call.name, id = ?call.id, "synthesizing response for unanswered call");
        contents.push(WireContent::new(
            "user",
            vec![WirePart::FunctionResponse(FunctionResponse {
                name: call.name.clone(),
                response: serde_json::Value::Object(serde_json::Map::new()),
                id: call.id.clone(),
            })],
        ));
        report.synthesized_responses += 1;
    }

    if !removed.is_empty() {
        for (turn_idx, turn) in contents.iter_mut().enumerate() {
            let mut part_idx = 0usize;
            turn.parts.retain(|_| {
                let keep = !removed.contains(&(turn_idx, part_idx));
                part_idx += 1;
                keep
            });
        }
    }

    let before = contents.len();
    contents.retain(|turn| !turn.parts.is_empty());
    report.removed_turns = before - contents.len();

    if !report.is_noop() {
        tracing::debug!(?report, "balanced wire contents");
    }
    report
}

/// Strip signatures from every part that is not a function call and attach
/// each to the nearest unsigned function call: same turn, then preceding
/// turns nearest-first, then following turns nearest-first.
fn reattach_orphan_signatures(
    contents: &mut [WireContent],
    removed: &mut FxHashSet<(usize, usize)>,
    report: &mut BalanceReport,
) {
    let mut orphans: Vec<(usize, usize, String)> = Vec::new();
    for (turn_idx, turn) in contents.iter_mut().enumerate() {
        for (part_idx, part) in turn.parts.iter_mut().enumerate() {
            let taken = match part {
                WirePart::Text { signature, .. } | WirePart::Thought { signature, .. } => {
                    signature.take()
                }
                WirePart::Signature(signature) => {
                    removed.insert((turn_idx, part_idx));
                    Some(std::mem::take(signature))
                }
                _ => None,
            };
            if let Some(signature) = taken.filter(|s| !s.is_empty()) {
                orphans.push((turn_idx, part_idx, signature));
            }
        }
    }

    for (turn_idx, part_idx, signature) in orphans {
        match find_unsigned_call(contents, turn_idx, part_idx) {
            Some((target_turn, target_part)) => {
                if let WirePart::FunctionCall { signature: slot, .. } =
                    &mut contents[target_turn].parts[target_part]
                {
                    *slot = Some(signature);
                    report.reattached_signatures += 1;
                }
            }
            None => {
                tracing::debug!("dropping orphan signature with no function call to attach to");
                report.dropped_signatures += 1;
            }
        }
    }
}

fn is_unsigned_call(part: &WirePart) -> bool {
    matches!(part, WirePart::FunctionCall { signature: None, .. })
}

fn find_unsigned_call(
    contents: &[WireContent],
    turn_idx: usize,
    part_idx: usize,
) -> Option<(usize, usize)> {
    let parts = &contents[turn_idx].parts;
    let same_turn = (part_idx + 1..parts.len())
        .chain((0..part_idx).rev())
        .find(|&idx| is_unsigned_call(&parts[idx]));
    if let Some(idx) = same_turn {
        return Some((turn_idx, idx));
    }

    for prev in (0..turn_idx).rev() {
        if let Some(idx) = contents[prev].parts.iter().rposition(is_unsigned_call) {
            return Some((prev, idx));
        }
    }
    for next in turn_idx + 1..contents.len() {
        if let Some(idx) = contents[next].parts.iter().position(is_unsigned_call) {
            return Some((next, idx));
        }
    }
    None
}
