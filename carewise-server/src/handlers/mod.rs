pub mod analysis;
pub mod batch;
pub mod queue;

use std::collections::BTreeSet;

use carewise_core::{
    Result,
    analysis::{ModuleKind, module_set},
};

/// Parses wire module names, rejecting unknown ones and empty lists.
pub(crate) fn parse_modules(names: &[String]) -> Result<BTreeSet<ModuleKind>> {
    let kinds = names
        .iter()
        .map(|name| name.parse::<ModuleKind>())
        .collect::<Result<Vec<_>>>()?;
    module_set(kinds)
}
