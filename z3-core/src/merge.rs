//! Conflict resolution between local edits and remote changes.
//!
//! Every conflicting subject ends in exactly one terminal state.
//! Merges never delete a predicate that only one side has; remote
//! tombstones always win.

use crate::detect::LocalChange;
use crate::remote::{RemoteChange, RemoteEntry};
use crate::triple::{Fields, RemoteFields};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which side wins when both changed the same subject.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergePolicy {
    #[default]
    Remote,
    Local,
    /// Touch neither side; retry next cycle.
    Ignore,
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MergePolicy::Remote => "remote",
            MergePolicy::Local => "local",
            MergePolicy::Ignore => "ignore",
        })
    }
}

impl FromStr for MergePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "remote" => Ok(MergePolicy::Remote),
            "local" => Ok(MergePolicy::Local),
            "ignore" => Ok(MergePolicy::Ignore),
            other => Err(format!("unknown merge priority: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeState {
    RemoteWins,
    LocalWins,
    Skipped,
    Deleted,
}

/// Outcome of resolving one conflicting subject.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Store `fields` as the remote state at `version`.
    RemoteWins { fields: Fields, version: u64 },
    /// Store `merged` and upload `upload` against `version`.
    LocalWins {
        merged: Fields,
        version: u64,
        upload: RemoteFields,
    },
    /// Push the local tombstone against `version`.
    LocalDelete { version: u64 },
    /// Remote tombstone applies.
    Deleted { version: u64 },
    Skipped,
}

impl Resolution {
    pub fn state(&self) -> MergeState {
        match self {
            Resolution::RemoteWins { .. } => MergeState::RemoteWins,
            Resolution::LocalWins { .. } | Resolution::LocalDelete { .. } => MergeState::LocalWins,
            Resolution::Deleted { .. } => MergeState::Deleted,
            Resolution::Skipped => MergeState::Skipped,
        }
    }
}

/// Resolve a subject changed on both sides.
pub fn resolve(policy: MergePolicy, local: &LocalChange, remote: &RemoteEntry) -> Resolution {
    let remote_fields = match &remote.change {
        RemoteChange::Tombstone => {
            return Resolution::Deleted {
                version: remote.version,
            }
        }
        RemoteChange::Fields(fields) => fields,
    };

    match (policy, local.deleted) {
        (MergePolicy::Ignore, _) => Resolution::Skipped,
        (MergePolicy::Remote, _) => Resolution::RemoteWins {
            fields: overlay(&local.fields, &remote_fields.to_fields()),
            version: remote.version,
        },
        (MergePolicy::Local, true) => Resolution::LocalDelete {
            version: remote.version,
        },
        (MergePolicy::Local, false) => Resolution::LocalWins {
            merged: overlay(&remote_fields.to_fields(), &local.fields),
            version: remote.version,
            upload: local.fields.remote_part(),
        },
    }
}

/// `base` with every predicate present in `winner` replaced by the winner's
/// values. Predicates only in `base` stay.
pub fn overlay(base: &Fields, winner: &Fields) -> Fields {
    let mut groups = base.grouped();
    for (predicate, values) in winner.grouped() {
        match groups.iter_mut().find(|(p, _)| *p == predicate) {
            Some((_, existing)) => *existing = values,
            None => groups.push((predicate, values)),
        }
    }
    Fields::from_groups(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triple::{ItemKey, Object, SubjectKind};
    use proptest::prelude::*;

    fn local(fields: Fields, deleted: bool) -> LocalChange {
        LocalChange {
            key: ItemKey::new("ABCD2345"),
            kind: SubjectKind::Item,
            remote_version: Some(3),
            edit_revision: 7,
            fields,
            deleted,
        }
    }

    fn remote(fields: Fields, version: u64) -> RemoteEntry {
        RemoteEntry {
            key: ItemKey::new("ABCD2345"),
            kind: SubjectKind::Item,
            version,
            change: RemoteChange::Fields(fields.remote_part()),
        }
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("Local".parse::<MergePolicy>().unwrap(), MergePolicy::Local);
        assert!("newest".parse::<MergePolicy>().is_err());
        assert_eq!(MergePolicy::default(), MergePolicy::Remote);
        assert_eq!(serde_json::to_string(&MergePolicy::Ignore).unwrap(), "\"ignore\"");
    }

    #[test]
    fn test_remote_wins_keeps_local_only_predicates() {
        let l = local(
            Fields::new().with("title", "A").with(".starred", "1").with("extra", "mine"),
            false,
        );
        let r = remote(Fields::new().with("title", "B").with("date", "2020"), 4);
        let Resolution::RemoteWins { fields, version } = resolve(MergePolicy::Remote, &l, &r) else {
            panic!("expected remote to win");
        };
        assert_eq!(version, 4);
        assert_eq!(fields.first_text("title"), Some("B"));
        assert_eq!(fields.first_text("date"), Some("2020"));
        assert_eq!(fields.first_text(".starred"), Some("1"));
        assert_eq!(fields.first_text("extra"), Some("mine"));
    }

    #[test]
    fn test_local_wins_uploads_only_recognized_fields() {
        let l = local(Fields::new().with("title", "A").with(".starred", "1"), false);
        let r = remote(Fields::new().with("title", "B").with("date", "2020"), 4);
        let resolution = resolve(MergePolicy::Local, &l, &r);
        assert_eq!(resolution.state(), MergeState::LocalWins);
        let Resolution::LocalWins { merged, version, upload } = resolution else {
            unreachable!();
        };
        assert_eq!(version, 4);
        assert_eq!(merged.first_text("title"), Some("A"));
        assert_eq!(merged.first_text("date"), Some("2020"));
        assert_eq!(upload.to_fields().predicate_names().into_iter().collect::<Vec<_>>(), vec!["title"]);
    }

    #[test]
    fn test_ignore_and_tombstones() {
        let l = local(Fields::new().with("title", "A"), false);
        let r = remote(Fields::new().with("title", "B"), 4);
        assert_eq!(resolve(MergePolicy::Ignore, &l, &r), Resolution::Skipped);

        let gone = RemoteEntry::tombstone(ItemKey::new("ABCD2345"), SubjectKind::Item, 9);
        for policy in [MergePolicy::Remote, MergePolicy::Local, MergePolicy::Ignore] {
            assert_eq!(resolve(policy, &l, &gone), Resolution::Deleted { version: 9 });
        }

        let dead = local(Fields::new().with("title", "A"), true);
        assert_eq!(
            resolve(MergePolicy::Local, &dead, &r),
            Resolution::LocalDelete { version: 4 }
        );
        assert_eq!(resolve(MergePolicy::Remote, &dead, &r).state(), MergeState::RemoteWins);
        assert_eq!(resolve(MergePolicy::Ignore, &dead, &r), Resolution::Skipped);
    }

    fn arb_fields() -> impl Strategy<Value = Fields> {
        let names = prop::sample::select(vec!["title", "date", "tag", "author", ".note", "file"]);
        prop::collection::vec((names, "[a-z]{1,4}"), 0..8).prop_map(|pairs| {
            pairs
                .into_iter()
                .fold(Fields::new(), |f, (name, value)| f.with(name, Object::text(value)))
        })
    }

    proptest! {
        #[test]
        fn prop_merge_never_drops_one_sided_predicates(l in arb_fields(), r in arb_fields()) {
            let lc = local(l.clone(), false);
            let re = remote(r.clone(), 4);
            let remote_part = r.remote_part().to_fields();

            if let Resolution::RemoteWins { fields, .. } = resolve(MergePolicy::Remote, &lc, &re) {
                for name in l.predicate_names().union(&remote_part.predicate_names()) {
                    prop_assert!(fields.contains(name));
                }
                for name in remote_part.predicate_names() {
                    prop_assert_eq!(fields.values(name), remote_part.values(name));
                }
            } else {
                prop_assert!(false, "remote policy must let remote win");
            }

            if let Resolution::LocalWins { merged, upload, .. } = resolve(MergePolicy::Local, &lc, &re) {
                for name in l.predicate_names() {
                    prop_assert_eq!(merged.values(name), l.values(name));
                }
                for name in remote_part.predicate_names() {
                    prop_assert!(merged.contains(name));
                }
                prop_assert!(upload.to_fields().iter().all(|(p, _)| !p.is_local()));
            } else {
                prop_assert!(false, "local policy must let local win");
            }
        }
    }
}
