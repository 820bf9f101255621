//! Privacy agents: the logical identities privacy contexts are keyed by.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};

use crate::fingerprint::Fingerprint;

pub const SYSTEM_DEFAULT_ID: &str = "system-default";
pub const PROTOTYPE_ID: &str = "prototype";
pub const USER_DEFAULT_ID: &str = "user-default";
pub const GROUP_ID_PREFIX: &str = "group.";

/// Stable identity of a privacy agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrivacyAgentId(String);

impl PrivacyAgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrivacyAgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Classification derived from an agent id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Well-known long-lived identity, never leaked and never evicted by the admission policy.
    Permanent,
    /// System generated, short-lived.
    Temporary,
    /// Member `seq` of the rotating sequential roster.
    SequentialGroup { seq: usize },
}

/// A unique agent to visit websites with. Visits through different agents
/// must not be linkable to the same user.
///
/// Two agents are the same identity iff their ids match, whatever their
/// fingerprints currently are.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivacyAgent {
    pub id: PrivacyAgentId,
    pub fingerprint: Fingerprint,
    /// Profile directory backing this agent, if it has one on disk
    pub context_dir: Option<PathBuf>,
}

impl PrivacyAgent {
    pub fn new(id: impl Into<String>, fingerprint: Fingerprint) -> Self {
        Self {
            id: PrivacyAgentId::new(id),
            fingerprint,
            context_dir: None,
        }
    }

    pub fn system_default() -> Self {
        Self::new(SYSTEM_DEFAULT_ID, Fingerprint::default())
    }

    pub fn prototype() -> Self {
        Self::new(PROTOTYPE_ID, Fingerprint::default())
    }

    pub fn user_default() -> Self {
        Self::new(USER_DEFAULT_ID, Fingerprint::default())
    }

    /// A temporary agent named after its freshly allocated profile directory.
    pub fn temporary(context_dir: PathBuf, fingerprint: Fingerprint) -> Self {
        let id = dir_ident(&context_dir);
        Self {
            id: PrivacyAgentId::new(id),
            fingerprint,
            context_dir: Some(context_dir),
        }
    }

    /// Member `seq` of the sequential roster.
    pub fn sequential(seq: usize, context_dir: PathBuf, fingerprint: Fingerprint) -> Self {
        Self::new(format!("{GROUP_ID_PREFIX}{seq}"), fingerprint).with_context_dir(context_dir)
    }

    pub fn with_context_dir(mut self, context_dir: PathBuf) -> Self {
        self.context_dir = Some(context_dir);
        self
    }

    pub fn kind(&self) -> AgentKind {
        let id = self.id.as_str();
        if matches!(id, SYSTEM_DEFAULT_ID | PROTOTYPE_ID | USER_DEFAULT_ID) {
            return AgentKind::Permanent;
        }
        match id
            .strip_prefix(GROUP_ID_PREFIX)
            .and_then(|seq| seq.parse().ok())
        {
            Some(seq) => AgentKind::SequentialGroup { seq },
            None => AgentKind::Temporary,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.kind() == AgentKind::Permanent
    }

    pub fn is_temporary(&self) -> bool {
        self.kind() == AgentKind::Temporary
    }

    /// Short human readable form, e.g. `0717a8Kx0s3` for `cx.0717a8Kx0s3`.
    pub fn display(&self) -> &str {
        let id = self.id.as_str();
        id.strip_prefix(crate::browser_files::CONTEXT_DIR_PREFIX)
            .unwrap_or(id)
    }
}

impl PartialEq for PrivacyAgent {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PrivacyAgent {}

impl Hash for PrivacyAgent {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for PrivacyAgent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PrivacyAgent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Display for PrivacyAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.fingerprint)
    }
}

static BROWSER_SERIAL: AtomicU64 = AtomicU64::new(1);

/// The browser process identity: one browser per privacy context. Equal iff
/// both the agent id and the serial match, so a context that replaces a
/// retired one with the same agent id never shares its browser.
#[derive(Debug, Clone)]
pub struct BrowserId {
    pub agent_id: PrivacyAgentId,
    pub serial: u64,
    pub fingerprint: Fingerprint,
    pub context_dir: Option<PathBuf>,
}

impl BrowserId {
    /// A browser identity with a freshly allocated serial.
    pub fn new(agent: &PrivacyAgent) -> Self {
        Self::with_serial(agent, Self::next_serial())
    }

    pub fn with_serial(agent: &PrivacyAgent, serial: u64) -> Self {
        Self {
            agent_id: agent.id.clone(),
            serial,
            fingerprint: agent.fingerprint.clone(),
            context_dir: agent.context_dir.clone(),
        }
    }

    pub fn next_serial() -> u64 {
        BROWSER_SERIAL.fetch_add(1, AtomicOrdering::Relaxed)
    }

    /// The browser's user data dir, a child of the context directory.
    /// `None` means the browser picks its own (system default profile).
    pub fn user_data_dir(&self) -> Option<PathBuf> {
        self.context_dir
            .as_ref()
            .map(|dir| dir.join(self.fingerprint.browser_kind.dir_name()))
    }
}

impl PartialEq for BrowserId {
    fn eq(&self, other: &Self) -> bool {
        self.serial == other.serial && self.agent_id == other.agent_id
    }
}

impl Eq for BrowserId {}

impl Hash for BrowserId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.agent_id.hash(state);
        self.serial.hash(state);
    }
}

impl fmt::Display for BrowserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.agent_id, self.serial)
    }
}

/// Which agent a fetch task must run under.
#[derive(Debug, Clone)]
pub enum AgentRequirement {
    /// Exactly this identity.
    Specific(PrivacyAgent),
    /// Any temporary identity the manager sees fit.
    AnyTemporary,
    /// The next member of the sequential roster.
    NextSequential,
}

impl From<PrivacyAgent> for AgentRequirement {
    fn from(agent: PrivacyAgent) -> Self {
        AgentRequirement::Specific(agent)
    }
}

/// Cycles through a bounded roster of sequential agent slots.
#[derive(Debug)]
pub struct SequentialRoster {
    counter: AtomicUsize,
    max_agents: usize,
}

impl SequentialRoster {
    pub fn new(max_agents: usize) -> Self {
        Self {
            counter: AtomicUsize::new(0),
            max_agents: max_agents.max(1),
        }
    }

    /// Next slot number, in `1..=max_agents`.
    pub fn next_seq(&self) -> usize {
        self.counter.fetch_add(1, AtomicOrdering::Relaxed) % self.max_agents + 1
    }

    pub fn max_agents(&self) -> usize {
        self.max_agents
    }
}

fn dir_ident(dir: &Path) -> String {
    dir.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::BrowserKind;

    #[test]
    fn test_kind_is_derived_from_id() {
        assert!(PrivacyAgent::system_default().is_permanent());
        assert!(PrivacyAgent::prototype().is_permanent());
        assert!(PrivacyAgent::user_default().is_permanent());
        assert!(PrivacyAgent::new("A", Fingerprint::default()).is_temporary());

        let group = PrivacyAgent::sequential(3, PathBuf::from("/tmp/g/cx.3"), Fingerprint::default());
        assert_eq!(group.kind(), AgentKind::SequentialGroup { seq: 3 });
    }

    #[test]
    fn test_equality_is_by_id_only() {
        let a = PrivacyAgent::new("A", Fingerprint::new(BrowserKind::Chrome));
        let b = PrivacyAgent::new("A", Fingerprint::random(BrowserKind::Chromium));
        assert_eq!(a, b);
        assert_ne!(a, PrivacyAgent::new("B", Fingerprint::default()));
    }

    #[test]
    fn test_temporary_agent_named_after_dir() {
        let agent = PrivacyAgent::temporary(
            PathBuf::from("/tmp/ctx/18/cx.1018a1b2c3"),
            Fingerprint::default(),
        );
        assert_eq!(agent.id.as_str(), "cx.1018a1b2c3");
        assert_eq!(agent.display(), "1018a1b2c3");
        assert!(agent.is_temporary());
    }

    #[test]
    fn test_roster_cycles_modulo_max() {
        let roster = SequentialRoster::new(3);
        let seqs: Vec<_> = (0..7).map(|_| roster.next_seq()).collect();
        assert_eq!(seqs, vec![1, 2, 3, 1, 2, 3, 1]);
    }

    #[test]
    fn test_user_data_dir_is_child_of_context_dir() {
        let agent = PrivacyAgent::temporary(PathBuf::from("/tmp/ctx/cx.1"), Fingerprint::default());
        let id = BrowserId::new(&agent);
        assert_eq!(id.user_data_dir(), Some(PathBuf::from("/tmp/ctx/cx.1/chrome")));
        assert_eq!(BrowserId::new(&PrivacyAgent::system_default()).user_data_dir(), None);
    }

    #[test]
    fn test_browser_ids_for_same_agent_are_distinct() {
        let agent = PrivacyAgent::new("A", Fingerprint::default());
        let first = BrowserId::new(&agent);
        let second = BrowserId::new(&agent);
        assert_ne!(first, second);
        assert_eq!(first, first.clone());
        assert_eq!(BrowserId::with_serial(&agent, 7), BrowserId::with_serial(&agent, 7));
        assert_eq!(BrowserId::with_serial(&agent, 7).to_string(), "A#7");
    }
}
