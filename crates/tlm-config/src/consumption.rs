/// What the binary was started to do. Decides which config keys are read and
/// which stores must be resolvable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Subscribe to the bus and persist mapped messages.
    Ingest,
    /// Compare the primary store against the destination store.
    Reconcile,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Ingest => "INGEST",
            RunMode::Reconcile => "RECONCILE",
        }
    }
}

/// JSON-pointer prefixes read in `mode`. Keep in step with the code that
/// actually reads them (`TlmConfig` consumers in tlm-cli).
pub fn consumed_pointers(mode: RunMode) -> &'static [&'static str] {
    match mode {
        RunMode::Ingest => INGEST,
        RunMode::Reconcile => RECONCILE,
    }
}

static INGEST: &[&str] = &[
    "/database/url",
    "/database/storeTablename",
    "/database/keyFields",
    "/mqtt",
    "/mapping",
];

static RECONCILE: &[&str] = &[
    "/database/url",
    "/database/storeTablename",
    "/database/keyFields",
    "/reconcile",
];
