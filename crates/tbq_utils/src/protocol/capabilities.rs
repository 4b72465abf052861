//! Worker capabilities, and the requirements buckets place on them.

use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};

/// Named capabilities a worker advertises, e.g. `gpu`, or `os.version = 13.4`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerCapabilities(BTreeMap<String, String>);

impl WorkerCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a capability without a meaningful value.
    pub fn with(mut self, name: impl Into<String>) -> Self {
        self.0.insert(name.into(), String::new());
        self
    }

    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Whether these capabilities meet every one of the given requirements.
    pub fn satisfy<'a>(
        &self,
        requirements: impl IntoIterator<Item = &'a CapabilityRequirement>,
    ) -> bool {
        requirements
            .into_iter()
            .all(|requirement| requirement.is_satisfied_by(self))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for WorkerCapabilities {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum CapabilityConstraint {
    Present,
    Absent,
    Equal(String),
    NotEqual(String),
}

/// A predicate a worker must satisfy to lease a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapabilityRequirement {
    pub capability_name: String,
    pub constraint: CapabilityConstraint,
}

impl CapabilityRequirement {
    pub fn present(name: impl Into<String>) -> Self {
        Self {
            capability_name: name.into(),
            constraint: CapabilityConstraint::Present,
        }
    }

    pub fn absent(name: impl Into<String>) -> Self {
        Self {
            capability_name: name.into(),
            constraint: CapabilityConstraint::Absent,
        }
    }

    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            capability_name: name.into(),
            constraint: CapabilityConstraint::Equal(value.into()),
        }
    }

    pub fn not_equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            capability_name: name.into(),
            constraint: CapabilityConstraint::NotEqual(value.into()),
        }
    }

    pub fn is_satisfied_by(&self, capabilities: &WorkerCapabilities) -> bool {
        let actual = capabilities.get(&self.capability_name);
        match (&self.constraint, actual) {
            (CapabilityConstraint::Present, found) => found.is_some(),
            (CapabilityConstraint::Absent, found) => found.is_none(),
            (CapabilityConstraint::Equal(expected), Some(found)) => expected == found,
            (CapabilityConstraint::Equal(_), None) => false,
            (CapabilityConstraint::NotEqual(expected), Some(found)) => expected != found,
            // A missing capability is trivially not equal to anything.
            (CapabilityConstraint::NotEqual(_), None) => true,
        }
    }
}

#[cfg(test)]
mod test {
    use super::{CapabilityRequirement, WorkerCapabilities};

    #[test]
    fn presence_and_absence() {
        let gpu = WorkerCapabilities::new().with("gpu");
        let plain = WorkerCapabilities::new();

        assert!(CapabilityRequirement::present("gpu").is_satisfied_by(&gpu));
        assert!(!CapabilityRequirement::present("gpu").is_satisfied_by(&plain));
        assert!(CapabilityRequirement::absent("gpu").is_satisfied_by(&plain));
        assert!(!CapabilityRequirement::absent("gpu").is_satisfied_by(&gpu));
    }

    #[test]
    fn value_constraints() {
        let caps = WorkerCapabilities::new().with_value("os", "13.4");

        assert!(CapabilityRequirement::equal("os", "13.4").is_satisfied_by(&caps));
        assert!(!CapabilityRequirement::equal("os", "14.0").is_satisfied_by(&caps));
        assert!(CapabilityRequirement::not_equal("os", "14.0").is_satisfied_by(&caps));
        assert!(CapabilityRequirement::not_equal("arch", "arm64").is_satisfied_by(&caps));
        assert!(!CapabilityRequirement::equal("arch", "arm64").is_satisfied_by(&caps));
    }

    #[test]
    fn no_requirements_are_always_satisfied() {
        assert!(WorkerCapabilities::new().satisfy(&[]));
    }

    #[test]
    fn all_requirements_must_hold() {
        let caps: WorkerCapabilities = [("gpu", ""), ("os", "13.4")].into_iter().collect();
        let requirements = [
            CapabilityRequirement::present("gpu"),
            CapabilityRequirement::equal("os", "14.0"),
        ];
        assert!(!caps.satisfy(&requirements));
        assert!(caps.satisfy(&requirements[..1]));
    }
}
