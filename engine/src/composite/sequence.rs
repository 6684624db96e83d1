// composite/sequence.rs — <sequence from to step length type>
//
// One unlinked replacement per entry of the `values` array variable. Entry
// `i` keeps its identity across recomputations, so value changes patch the
// existing replacement's state and shrinking withholds the tail instead of
// deleting it.

use crate::diag::{codes, Diagnostic};
use crate::document::Document;
use crate::error::Result;
use crate::id::{ComponentIdx, SourceIdentity};
use crate::registry;
use crate::serialized::SerializedComponent;
use crate::state::{Dependency, DependencySet};
use crate::value::format_number;

use super::{Batches, SourceBatch};

pub fn declared_dependencies() -> DependencySet {
    let own = ["from", "to", "step", "length", "type"]
        .into_iter()
        .map(|v| (v.to_string(), Dependency::Own { var: v.to_string() }));
    let attrs = ["createComponentOfType", "numComponents"]
        .into_iter()
        .map(|n| (n.to_string(), Dependency::Attribute { name: n.to_string() }));
    own.chain(attrs).collect()
}

/// Replacement type for a sequence `type`; unknown types count as numbers.
fn entry_type(kind: &str) -> &'static str {
    match kind {
        "letters" => "text",
        "math" => "math",
        _ => "number",
    }
}

pub fn batches(doc: &Document, idx: ComponentIdx, uid: &str) -> Result<Batches> {
    let n = doc
        .state_value(idx, "length")?
        .as_number()
        .filter(|n| n.is_finite() && *n > 0.0)
        .map_or(0, |n| n as usize);
    let t = entry_type(&doc.state_value(idx, "type")?.to_text());

    let mut out = Batches::default();
    let max = doc.options().max_sequence_length;
    if let Some(requested) = doc.state_value(idx, "requestedLength")?.as_number() {
        if requested > max as f64 {
            out.diagnostics.push(
                Diagnostic::warning(format!(
                    "<sequence> {} asks for {} entries, only the first {} are produced",
                    uid,
                    format_number(requested),
                    max
                ))
                .with_code(codes::W0305)
                .with_hint("raise maxSequenceLength to allow longer sequences")
                .at(idx),
            );
        }
    }
    for i in 0..n {
        let value = doc.state_value(idx, &format!("values[{}]", i))?;
        let mut batch = SourceBatch::new(SourceIdentity::Index(i));
        batch.compare_state = true;
        batch.replacements.push(
            SerializedComponent::new(t)
                .with_identifier(format!("{}:{}", uid, i + 1))
                .with_state("value", registry::coerce_essential(t, "value", value)),
        );
        out.sources.push(batch);
    }
    Ok(out)
}
