use crate::error::ComposeError;

/// Maps composite-schema type names back to their owning backend and
/// original name, and the inverse used while merged names are generated.
///
/// The prefix convention is `UpperCamel(namespace) + "_"`, so backend
/// `users` owns `Users_User`. Prefix matching is longest-prefix over all
/// configured backends; construction rejects any prefix that is itself a
/// prefix of another backend's prefix.
pub struct NamespaceRouter {
    /// (backend namespace, merged-name prefix), sorted by prefix length
    /// descending so the first match is the longest.
    prefixes: Vec<(String, String)>,
}

impl NamespaceRouter {
    pub fn new<I, S>(namespaces: I) -> Result<Self, ComposeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut prefixes: Vec<(String, String)> = Vec::new();
        for ns in namespaces {
            let ns = ns.as_ref();
            if prefixes.iter().any(|(existing, _)| existing == ns) {
                return Err(ComposeError::DuplicateBackend(ns.to_string()));
            }
            prefixes.push((ns.to_string(), namespace_prefix(ns)));
        }

        for (i, (_, a)) in prefixes.iter().enumerate() {
            for (_, b) in prefixes.iter().skip(i + 1) {
                if a.starts_with(b.as_str()) || b.starts_with(a.as_str()) {
                    return Err(ComposeError::AmbiguousPrefix {
                        first: a.clone(),
                        second: b.clone(),
                    });
                }
            }
        }

        prefixes.sort_by(|(_, a), (_, b)| b.len().cmp(&a.len()));
        Ok(NamespaceRouter { prefixes })
    }

    /// The merged-name prefix of a configured backend.
    pub fn prefix_of(&self, backend: &str) -> Option<&str> {
        self.prefixes
            .iter()
            .find(|(ns, _)| ns == backend)
            .map(|(_, p)| p.as_str())
    }

    /// `prefix_of(backend) + original` for a configured backend.
    pub fn merged_name(&self, backend: &str, original: &str) -> Option<String> {
        self.prefix_of(backend).map(|p| format!("{}{}", p, original))
    }

    /// Longest-prefix match of a merged type name. `None` means the name
    /// does not belong to any configured backend; callers treat that as
    /// "not ours, skip".
    pub fn route<'a>(&'a self, merged: &'a str) -> Option<(&'a str, &'a str)> {
        self.prefixes.iter().find_map(|(ns, prefix)| {
            merged
                .strip_prefix(prefix.as_str())
                .map(|original| (ns.as_str(), original))
        })
    }
}

/// `user_accounts` -> `UserAccounts_`
fn namespace_prefix(namespace: &str) -> String {
    let mut prefix = String::with_capacity(namespace.len() + 1);
    for segment in namespace.split(['_', '-']) {
        let mut chars = segment.chars();
        if let Some(first) = chars.next() {
            prefix.extend(first.to_uppercase());
            prefix.push_str(chars.as_str());
        }
    }
    prefix.push('_');
    prefix
}
