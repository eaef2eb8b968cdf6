use std::collections::{BTreeMap, BTreeSet};

use caskpack_core::PackageDefinition;

/// Installed casks outside `removing` whose recursive `depends_on` closure
/// reaches any token in `removing`. Sorted by token.
pub fn installed_dependents(
    installed: &[PackageDefinition],
    removing: &BTreeSet<String>,
) -> Vec<String> {
    let requirements: BTreeMap<&str, &[String]> = installed
        .iter()
        .map(|definition| (definition.token.as_str(), definition.depends_on.as_slice()))
        .collect();

    requirements
        .keys()
        .filter(|token| !removing.contains(**token))
        .filter(|token| {
            requirement_closure(&requirements, **token)
                .iter()
                .any(|requirement| removing.contains(*requirement))
        })
        .map(|token| (*token).to_string())
        .collect()
}

fn requirement_closure<'a>(
    requirements: &BTreeMap<&'a str, &'a [String]>,
    root: &'a str,
) -> BTreeSet<&'a str> {
    let mut closure = BTreeSet::new();
    let mut pending = vec![root];
    while let Some(token) = pending.pop() {
        let Some(direct) = requirements.get(token) else {
            continue;
        };
        for requirement in direct.iter() {
            if closure.insert(requirement.as_str()) {
                pending.push(requirement.as_str());
            }
        }
    }
    closure
}
