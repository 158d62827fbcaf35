//! Worker identity and bus addressing (§3 "Worker identity", §4.3).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of the bus a worker sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerEnd {
    Frontend,
    Backend,
}

impl fmt::Display for WorkerEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerEnd::Frontend => write!(f, "frontend"),
            WorkerEnd::Backend => write!(f, "backend"),
        }
    }
}

/// A worker's unique subject on the bus.
///
/// `end.name` or `end.name.subname` (dots in `subname` replaced with `_`).
/// Stable for the worker's lifetime, used both as the bus subject filter and
/// as the durable consumer name (after a second dot-to-underscore pass, since
/// consumer names may not contain dots).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerAddress {
    pub end: WorkerEnd,
    pub name: String,
    pub subname: Option<String>,
}

impl WorkerAddress {
    pub fn new(end: WorkerEnd, name: impl Into<String>, subname: Option<String>) -> Self {
        Self {
            end,
            name: name.into(),
            subname,
        }
    }

    /// The bus subject, e.g. `frontend.irc.irc_libera_chat` or `backend.gpt`.
    pub fn subject(&self) -> String {
        match &self.subname {
            Some(sub) if !sub.is_empty() => {
                format!("{}.{}.{}", self.end, self.name, sub.replace('.', "_"))
            }
            _ => format!("{}.{}", self.end, self.name),
        }
    }

    /// The durable consumer name: the subject with every `.` replaced by `_`
    /// (consumer names may not contain `.` on most brokers).
    pub fn consumer_name(&self) -> String {
        self.subject().replace('.', "_")
    }
}

impl fmt::Display for WorkerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.subject())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_address_has_no_subname_suffix() {
        let addr = WorkerAddress::new(WorkerEnd::Backend, "gpt", None);
        assert_eq!(addr.subject(), "backend.gpt");
    }

    #[test]
    fn subname_dots_are_replaced() {
        let addr = WorkerAddress::new(
            WorkerEnd::Frontend,
            "irc",
            Some("irc.libera.chat".to_string()),
        );
        assert_eq!(addr.subject(), "frontend.irc.irc_libera_chat");
    }

    #[test]
    fn consumer_name_has_no_dots() {
        let addr = WorkerAddress::new(
            WorkerEnd::Frontend,
            "irc",
            Some("irc.libera.chat".to_string()),
        );
        assert_eq!(addr.consumer_name(), "frontend_irc_irc_libera_chat");
        assert!(!addr.consumer_name().contains('.'));
    }

    /// Testable property 1: a set of worker addresses never collides, and
    /// the address formula matches spec §8 exactly.
    #[test]
    fn address_uniqueness_across_many_workers() {
        let addrs = vec![
            WorkerAddress::new(WorkerEnd::Frontend, "irc", Some("a.b.c".into())),
            WorkerAddress::new(WorkerEnd::Frontend, "irc", Some("d.e.f".into())),
            WorkerAddress::new(WorkerEnd::Backend, "gpt", None),
            WorkerAddress::new(WorkerEnd::Backend, "image", None),
            WorkerAddress::new(WorkerEnd::Frontend, "discord", None),
            WorkerAddress::new(WorkerEnd::Frontend, "slack", None),
        ];
        let mut seen = std::collections::HashSet::new();
        for addr in &addrs {
            assert!(seen.insert(addr.subject()), "duplicate address: {addr}");
        }
    }
}
