//! Ban/unban actions.
//!
//! An action is a small capability surface (`start`, `stop`, `check`,
//! `ban`, `unban`, `flush`, `reload`, introspection) with two
//! implementations: [`CommandAction`] renders shell templates by tag
//! substitution, [`ScriptedAction`] dispatches named methods to an external
//! executable. Jails own an ordered [`ActionRegistry`]; bans run the chain
//! in declaration order, stop runs it in reverse.

mod command;
mod script;

pub use command::CommandAction;
pub use script::ScriptedAction;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::OnceLock;

use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;

use crate::error::{Error, Result};
use crate::ip::IpAddress;
use crate::ticket::BanTicket;

/// Bound on substitution passes before a cycle is assumed.
const MAX_TAG_ITERATIONS: usize = 25;

/// The environment rendered into `<tag>` occurrences.
///
/// Composed of the ticket fields (when a ticket is present), the jail
/// name, and lazily resolved extras like the reverse-DNS host.
#[derive(Debug, Clone)]
pub struct ActionInfo {
    /// Owning jail name.
    pub jail: String,
    /// The ticket being banned/unbanned, absent for start/stop/check.
    pub ticket: Option<BanTicket>,
    /// Jail default ban time, the `<bantime>` fallback.
    pub default_ban_time: i64,
    /// Reverse-DNS name of the ticket IP, when resolved ahead of the call.
    pub ip_host: Option<String>,
}

impl ActionInfo {
    /// Info without a ticket (start/stop/check/flush).
    pub fn jail_only(jail: impl Into<String>, default_ban_time: i64) -> ActionInfo {
        ActionInfo {
            jail: jail.into(),
            ticket: None,
            default_ban_time,
            ip_host: None,
        }
    }

    /// Info for a ticket operation.
    pub fn for_ticket(
        jail: impl Into<String>,
        ticket: BanTicket,
        default_ban_time: i64,
    ) -> ActionInfo {
        ActionInfo {
            jail: jail.into(),
            ticket: Some(ticket),
            default_ban_time,
            ip_host: None,
        }
    }

    /// The ticket id, if any.
    pub fn ip(&self) -> Option<&IpAddress> {
        self.ticket.as_ref().map(|t| t.id())
    }

    /// Resolve one `<tag>` from the info.
    pub fn lookup(&self, tag: &str) -> Option<String> {
        match tag {
            "name" => return Some(self.jail.clone()),
            "ip-host" => return Some(self.ip_host.clone().unwrap_or_else(|| "unknown".into())),
            _ => {}
        }
        let ticket = self.ticket.as_ref()?;
        match tag {
            "ip" => Some(ticket.id().ntoa()),
            "fid" => Some(ticket.id().raw().to_string()),
            "ip-rev" => Some(ticket.id().get_ptr(None)),
            "family" => Some(ticket.id().family().name().to_string()),
            "failures" => Some(ticket.attempts().to_string()),
            "retries" => Some(ticket.retry().to_string()),
            "time" => Some((ticket.time() as i64).to_string()),
            "bantime" => Some(ticket.ban_time(self.default_ban_time).to_string()),
            "bancount" => Some(ticket.ban_count().to_string()),
            "restored" => Some(if ticket.restored() { "1" } else { "0" }.to_string()),
            "matches" => Some(ticket.matches().join("\n")),
            _ => {
                // <F-USER> style tags read from the ticket data bag
                let key = tag.strip_prefix("F-")?.to_ascii_lowercase();
                ticket.get_data(&key).map(String::from)
            }
        }
    }
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<([\w/\-.]+)>").expect("static regex"))
}

/// Render `<tag>` occurrences from `env` until a fixed point.
///
/// Values may themselves contain tags; rendering iterates with a bound so
/// tag cycles fail instead of hanging. Any tag left unresolved at the
/// fixed point is an error.
pub fn substitute_tags(
    template: &str,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<String> {
    let mut current = template.to_string();
    for _ in 0..MAX_TAG_ITERATIONS {
        let mut changed = false;
        let mut next = String::with_capacity(current.len());
        let mut last = 0;
        for caps in tag_regex().captures_iter(&current) {
            let whole = caps.get(0).expect("group 0");
            let tag = caps.get(1).expect("tag").as_str();
            next.push_str(&current[last..whole.start()]);
            match env(tag) {
                Some(value) => {
                    changed = true;
                    next.push_str(&value);
                }
                None => next.push_str(whole.as_str()),
            }
            last = whole.end();
        }
        next.push_str(&current[last..]);
        if !changed {
            if let Some(caps) = tag_regex().captures(&next) {
                return Err(Error::Substitution(format!(
                    "unresolved tag <{}> in {:?}",
                    caps.get(1).expect("tag").as_str(),
                    template
                )));
            }
            return Ok(next);
        }
        current = next;
    }
    Err(Error::Substitution(format!(
        "substitution of {:?} exceeded {} passes (tag cycle?)",
        template, MAX_TAG_ITERATIONS
    )))
}

/// The action capability surface.
#[async_trait]
pub trait Action: Send + Sync {
    /// The action name inside its jail.
    fn name(&self) -> &str;

    /// `"command"` or `"script"`.
    fn kind(&self) -> &'static str;

    /// Set one property.
    fn set_property(&self, key: &str, value: &str);

    /// Read one property.
    fn get_property(&self, key: &str) -> Option<String>;

    /// Property names, for `actionproperties`.
    fn properties(&self) -> Vec<String>;

    /// Invocable method names, for `actionmethods`.
    fn methods(&self) -> Vec<String>;

    /// Bring the action up.
    async fn start(&self, info: &ActionInfo) -> Result<()>;

    /// Tear the action down.
    async fn stop(&self, info: &ActionInfo) -> Result<()>;

    /// Verify the action environment is sane.
    async fn check(&self, info: &ActionInfo) -> Result<()>;

    /// Ban the ticket in `info`.
    async fn ban(&self, info: &ActionInfo) -> Result<()>;

    /// Unban the ticket in `info`.
    async fn unban(&self, info: &ActionInfo) -> Result<()>;

    /// Drop all bans at once, where supported.
    async fn flush(&self, info: &ActionInfo) -> Result<()>;

    /// Re-arm after configuration changes.
    async fn reload(&self, info: &ActionInfo) -> Result<()>;

    /// Call a named method with JSON kwargs; returns its output.
    async fn invoke(
        &self,
        method: &str,
        kwargs: serde_json::Value,
        info: &ActionInfo,
    ) -> Result<String>;
}

/// The ordered set of actions owned by one jail.
#[derive(Default)]
pub struct ActionRegistry {
    actions: RwLock<Vec<(String, Arc<dyn Action>)>>,
}

impl ActionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an action; duplicate names are rejected.
    pub fn add(&self, jail: &str, name: &str, action: Arc<dyn Action>) -> Result<()> {
        let mut actions = self.actions.write();
        if actions.iter().any(|(n, _)| n == name) {
            return Err(Error::AlreadyExists(format!(
                "Action '{}' already exists for jail '{}'",
                name, jail
            )));
        }
        actions.push((name.to_string(), action));
        Ok(())
    }

    /// Remove an action by name.
    pub fn remove(&self, jail: &str, name: &str) -> Result<Arc<dyn Action>> {
        let mut actions = self.actions.write();
        let pos = actions
            .iter()
            .position(|(n, _)| n == name)
            .ok_or_else(|| Error::no_action(jail, name))?;
        Ok(actions.remove(pos).1)
    }

    /// Fetch one action.
    pub fn get(&self, jail: &str, name: &str) -> Result<Arc<dyn Action>> {
        self.actions
            .read()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, a)| a.clone())
            .ok_or_else(|| Error::no_action(jail, name))
    }

    /// Action names in declaration order.
    pub fn names(&self) -> Vec<String> {
        self.actions.read().iter().map(|(n, _)| n.clone()).collect()
    }

    /// Snapshot of the chain in declaration order.
    pub fn ordered(&self) -> Vec<Arc<dyn Action>> {
        self.actions.read().iter().map(|(_, a)| a.clone()).collect()
    }

    /// Snapshot of the chain in reverse order (stop path).
    pub fn reversed(&self) -> Vec<Arc<dyn Action>> {
        let mut actions = self.ordered();
        actions.reverse();
        actions
    }

    /// Number of actions.
    pub fn len(&self) -> usize {
        self.actions.read().len()
    }

    /// Whether no actions are registered.
    pub fn is_empty(&self) -> bool {
        self.actions.read().is_empty()
    }
}

/// Compose a tag environment from info, properties and `known/` fallbacks.
pub(crate) fn compose_env<'a>(
    info: &'a ActionInfo,
    properties: &'a BTreeMap<String, String>,
) -> impl Fn(&str) -> Option<String> + 'a {
    move |tag: &str| {
        if let Some(value) = info.lookup(tag) {
            return Some(value);
        }
        if let Some(value) = properties.get(tag) {
            return Some(value.clone());
        }
        // <known/chain> falls back to the action's own defaults
        if let Some(known) = tag.strip_prefix("known/") {
            return properties.get(known).cloned();
        }
        None
    }
}
