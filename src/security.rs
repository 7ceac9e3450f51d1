//! Access control: per-model permissions and record rules.
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use tracing::warn;

use crate::NameHasher;
use crate::domain::{Domain, PredicateNode};
use crate::value::Value;

/// The user every access check lets through.
pub const SUPERUSER_ID: u64 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Read,
    Write,
    Create,
    Unlink,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Create => "create",
            Operation::Unlink => "unlink",
        };
        write!(f, "{}", name)
    }
}

/// Who is asking, plus free-form values that travel with an environment.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Context {
    pub uid: Option<u64>,
    pub groups: Vec<u64>,
    pub values: BTreeMap<String, Value>,
    superuser: bool,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn user(uid: u64) -> Self {
        Self { uid: Some(uid), ..Default::default() }
    }
    pub fn superuser() -> Self {
        Self { uid: Some(SUPERUSER_ID), superuser: true, ..Default::default() }
    }
    pub fn with_groups(mut self, groups: impl IntoIterator<Item = u64>) -> Self {
        self.groups.extend(groups);
        self
    }
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
    /// A copy of this context with all checks bypassed.
    pub fn elevated(&self) -> Self {
        Self { superuser: true, ..self.clone() }
    }
    pub fn is_superuser(&self) -> bool {
        self.superuser || self.uid == Some(SUPERUSER_ID)
    }
}

/// The answer to one access check. When allowed, `domain` (if any) further
/// restricts which records the operation may touch.
#[derive(Clone, Debug, PartialEq)]
pub struct AccessDecision {
    pub allowed: bool,
    pub domain: Option<Domain>,
}

impl AccessDecision {
    pub fn allow() -> Self {
        Self { allowed: true, domain: None }
    }
    pub fn deny() -> Self {
        Self { allowed: false, domain: None }
    }
    pub fn restricted(domain: Domain) -> Self {
        Self { allowed: true, domain: Some(domain) }
    }
}

pub trait Security: Send + Sync {
    fn check(&self, model: &str, operation: Operation, context: &Context) -> AccessDecision;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub unlink: bool,
}

impl Permissions {
    pub fn all() -> Self {
        Self { read: true, write: true, create: true, unlink: true }
    }
    pub fn none() -> Self {
        Self { read: false, write: false, create: false, unlink: false }
    }
    pub fn read_only() -> Self {
        Self { read: true, ..Self::none() }
    }
    pub fn allows(&self, operation: Operation) -> bool {
        match operation {
            Operation::Read => self.read,
            Operation::Write => self.write,
            Operation::Create => self.create,
            Operation::Unlink => self.unlink,
        }
    }
}

/// A domain records must satisfy for the listed operations. A rule without
/// groups is global.
#[derive(Clone, Debug)]
pub struct RecordRule {
    pub name: String,
    pub model: String,
    pub domain: Domain,
    pub groups: Vec<u64>,
    pub permissions: Permissions,
}

impl RecordRule {
    pub fn new(name: impl Into<String>, model: impl Into<String>, domain: Domain) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            domain,
            groups: Vec::new(),
            permissions: Permissions::all(),
        }
    }
    pub fn groups(mut self, groups: impl IntoIterator<Item = u64>) -> Self {
        self.groups.extend(groups);
        self
    }
    pub fn operations(mut self, permissions: Permissions) -> Self {
        self.permissions = permissions;
        self
    }
    fn applies_to(&self, model: &str, operation: Operation, context: &Context) -> bool {
        self.model == model
            && self.permissions.allows(operation)
            && (self.groups.is_empty() || self.groups.iter().any(|g| context.groups.contains(g)))
    }
}

#[derive(Clone, Debug)]
struct Grant {
    group: Option<u64>,
    permissions: Permissions,
}

/// Model permissions per group plus record rules. Global rules are all
/// enforced; group rules of the user's groups are alternatives.
#[derive(Clone, Debug, Default)]
pub struct RuleSecurity {
    grants: HashMap<String, Vec<Grant>, NameHasher>,
    rules: Vec<RecordRule>,
    deny_unlisted: bool,
}

impl RuleSecurity {
    pub fn new() -> Self {
        Self::default()
    }
    /// Models without any grant become inaccessible instead of open.
    pub fn deny_by_default(mut self) -> Self {
        self.deny_unlisted = true;
        self
    }
    /// Grants `permissions` on `model` to members of `group`, or to everyone.
    pub fn grant(mut self, model: impl Into<String>, group: Option<u64>, permissions: Permissions) -> Self {
        self.grants.entry(model.into()).or_default().push(Grant { group, permissions });
        self
    }
    pub fn rule(mut self, rule: RecordRule) -> Self {
        self.rules.push(rule);
        self
    }
}

impl Security for RuleSecurity {
    fn check(&self, model: &str, operation: Operation, context: &Context) -> AccessDecision {
        if context.is_superuser() {
            return AccessDecision::allow();
        }
        let allowed = match self.grants.get(model) {
            Some(grants) => grants.iter().any(|grant| {
                grant.permissions.allows(operation)
                    && grant.group.is_none_or(|group| context.groups.contains(&group))
            }),
            None => !self.deny_unlisted,
        };
        if !allowed {
            return AccessDecision::deny();
        }
        let mut global = PredicateNode::True;
        let mut grouped: Option<PredicateNode> = None;
        for rule in self.rules.iter().filter(|r| r.applies_to(model, operation, context)) {
            let node = match rule.domain.parse() {
                Ok(node) => node,
                Err(e) => {
                    warn!("Record rule '{}' is unusable: {}", rule.name, e);
                    return AccessDecision::deny();
                }
            };
            if rule.groups.is_empty() {
                global = PredicateNode::and(global, node);
            } else {
                grouped = Some(match grouped {
                    Some(other) => PredicateNode::or(other, node),
                    None => node,
                });
            }
        }
        let combined = match grouped {
            Some(grouped) => PredicateNode::and(global, grouped),
            None => global,
        };
        match combined {
            PredicateNode::True => AccessDecision::allow(),
            node => AccessDecision::restricted(node.to_domain()),
        }
    }
}
