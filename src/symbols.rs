//! Selection of which advertised symbols the pipeline transfers.

/// Which symbols to pull from the instrument.
///
/// The advertised set changes whenever the operator toggles channels, so the
/// effective set is recomputed from a fresh `AvailableNames` reply on every
/// acquisition iteration. Names are matched case-insensitively; requested
/// symbols that are not currently advertised are skipped for that iteration.
#[derive(Debug, Clone)]
pub(crate) enum SymbolSelection {
    /// Transfer every currently advertised symbol.
    All,
    /// Transfer the intersection of this list with the advertised set.
    /// Stored lowercased.
    Subset(Vec<String>),
}

impl SymbolSelection {
    pub(crate) fn new(user_list: Option<Vec<String>>) -> Self {
        match user_list {
            None => SymbolSelection::All,
            Some(list) => {
                SymbolSelection::Subset(list.iter().map(|s| s.to_lowercase()).collect())
            }
        }
    }

    /// The symbols to fetch this iteration, in the server's spelling.
    pub(crate) fn effective(&self, available: &[String]) -> Vec<String> {
        match self {
            SymbolSelection::All => available.to_vec(),
            SymbolSelection::Subset(wanted) => available
                .iter()
                .filter(|name| wanted.iter().any(|w| w == &name.to_lowercase()))
                .cloned()
                .collect(),
        }
    }
}
