/// Namespaces
///
/// CAIP-2 / CAIP-10 validation and the permission checks the engine runs
/// before anything reaches the wire.
///
use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::types::{Namespace, Namespaces};

fn is_namespace(s: &str) -> bool {
    (3..=8).contains(&s.len())
        && s.bytes()
            .all(|b| b == b'-' || b.is_ascii_lowercase() || b.is_ascii_digit())
}

fn is_reference(s: &str) -> bool {
    (1..=32).contains(&s.len())
        && s.bytes()
            .all(|b| b == b'-' || b == b'_' || b.is_ascii_alphanumeric())
}

fn is_address(s: &str) -> bool {
    (1..=128).contains(&s.len())
        && s.bytes().all(|b| {
            b == b'-' || b == b'.' || b == b'%' || b.is_ascii_alphanumeric()
        })
}

/// CAIP-2 `namespace:reference`
pub fn is_valid_chain_id(chain_id: &str) -> bool {
    match chain_id.split_once(':') {
        Some((namespace, reference)) => is_namespace(namespace) && is_reference(reference),
        None => false,
    }
}

/// CAIP-10 `namespace:reference:address`
pub fn is_valid_account_id(account: &str) -> bool {
    match account.rsplit_once(':') {
        Some((chain_id, address)) => is_valid_chain_id(chain_id) && is_address(address),
        None => false,
    }
}

/// `eip155:1:0xabc` -> `eip155:1`
pub fn account_chain(account: &str) -> Option<&str> {
    account
        .rsplit_once(':')
        .map(|(chain_id, _)| chain_id)
        .filter(|chain_id| is_valid_chain_id(chain_id))
}

fn namespace_of(key: &str) -> &str {
    key.split_once(':').map(|(ns, _)| ns).unwrap_or(key)
}

/// Chains a namespace entry covers: its `chains`, the chains of its
/// accounts, and the key itself when the key is a chain id.
pub fn effective_chains(key: &str, namespace: &Namespace) -> BTreeSet<String> {
    let mut chains: BTreeSet<String> = namespace.chains.iter().cloned().collect();
    chains.extend(
        namespace
            .accounts
            .iter()
            .filter_map(|a| account_chain(a))
            .map(str::to_string),
    );
    if is_valid_chain_id(key) {
        chains.insert(key.to_string());
    }
    chains
}

fn validate_key(key: &str) -> Result<()> {
    if is_namespace(key) || is_valid_chain_id(key) {
        Ok(())
    } else {
        Err(Error::Format(format!("invalid namespace key {key}")))
    }
}

fn validate_chains(key: &str, chains: &[String]) -> Result<()> {
    for chain in chains {
        if !is_valid_chain_id(chain) {
            return Err(Error::Format(format!("invalid chain id {chain} in {key}")));
        }
        if namespace_of(chain) != namespace_of(key) {
            return Err(Error::Format(format!("chain {chain} does not belong to {key}")));
        }
    }
    Ok(())
}

/// Shape check for `requiredNamespaces` / `optionalNamespaces` of a proposal.
/// Every entry must name at least one chain; methods and events may be empty.
pub fn validate_proposal_namespaces(namespaces: &Namespaces) -> Result<()> {
    for (key, namespace) in namespaces {
        validate_key(key)?;
        validate_chains(key, &namespace.chains)?;
        if namespace.chains.is_empty() && !is_valid_chain_id(key) {
            return Err(Error::Format(format!("namespace {key} has no chains")));
        }
    }
    Ok(())
}

/// Shape check for settled namespaces: accounts must be CAIP-10 and each
/// entry must cover at least one chain.
pub fn validate_session_namespaces(namespaces: &Namespaces) -> Result<()> {
    for (key, namespace) in namespaces {
        validate_key(key)?;
        validate_chains(key, &namespace.chains)?;
        for account in &namespace.accounts {
            if !is_valid_account_id(account) {
                return Err(Error::Format(format!("invalid account {account} in {key}")));
            }
            if namespace_of(account) != namespace_of(key) {
                return Err(Error::Format(format!(
                    "account {account} does not belong to {key}"
                )));
            }
        }
        if effective_chains(key, namespace).is_empty() {
            return Err(Error::Format(format!("namespace {key} has no chains")));
        }
    }
    Ok(())
}

/// Fails with `NamespaceMismatch` unless `approved` grants every chain,
/// method and event that `required` asks for. Entries are matched by their
/// CAIP-2 namespace, so a requirement keyed `eip155:1` is satisfied by an
/// approval keyed `eip155`.
pub fn check_superset(required: &Namespaces, approved: &Namespaces) -> Result<()> {
    for (key, wanted) in required {
        let namespace = namespace_of(key);
        let granted: Vec<(&String, &Namespace)> = approved
            .iter()
            .filter(|(k, _)| namespace_of(k) == namespace)
            .collect();
        if granted.is_empty() {
            return Err(Error::NamespaceMismatch(format!("{key} not approved")));
        }

        let chains: BTreeSet<String> = granted
            .iter()
            .flat_map(|(k, ns)| effective_chains(k, ns))
            .collect();
        if let Some(chain) = effective_chains(key, wanted)
            .into_iter()
            .find(|c| !chains.contains(c))
        {
            return Err(Error::NamespaceMismatch(format!("chain {chain} not approved")));
        }

        let methods: BTreeSet<&String> =
            granted.iter().flat_map(|(_, ns)| &ns.methods).collect();
        if let Some(method) = wanted.methods.iter().find(|m| !methods.contains(m)) {
            return Err(Error::NamespaceMismatch(format!(
                "method {method} not approved for {key}"
            )));
        }

        let events: BTreeSet<&String> =
            granted.iter().flat_map(|(_, ns)| &ns.events).collect();
        if let Some(event) = wanted.events.iter().find(|e| !events.contains(e)) {
            return Err(Error::NamespaceMismatch(format!(
                "event {event} not approved for {key}"
            )));
        }

        // every requested chain needs at least one account
        for chain in effective_chains(key, wanted) {
            let has_account = granted
                .iter()
                .flat_map(|(_, ns)| &ns.accounts)
                .any(|a| account_chain(a) == Some(chain.as_str()));
            if !has_account {
                return Err(Error::NamespaceMismatch(format!(
                    "no account approved for {chain}"
                )));
            }
        }
    }
    Ok(())
}

/// Fails with `MethodNotAllowed` unless some namespace entry grants `method`
/// on `chain_id`.
pub fn check_method(namespaces: &Namespaces, method: &str, chain_id: &str) -> Result<()> {
    let allowed = namespaces.iter().any(|(key, ns)| {
        ns.methods.iter().any(|m| m == method)
            && effective_chains(key, ns).contains(chain_id)
    });
    if allowed {
        Ok(())
    } else {
        Err(Error::MethodNotAllowed {
            method: method.to_string(),
            chain_id: chain_id.to_string(),
        })
    }
}

/// Same as `check_method` for session events.
pub fn check_event(namespaces: &Namespaces, event: &str, chain_id: &str) -> Result<()> {
    let allowed = namespaces.iter().any(|(key, ns)| {
        ns.events.iter().any(|e| e == event)
            && effective_chains(key, ns).contains(chain_id)
    });
    if allowed {
        Ok(())
    } else {
        Err(Error::MethodNotAllowed {
            method: event.to_string(),
            chain_id: chain_id.to_string(),
        })
    }
}
