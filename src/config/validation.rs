//! Configuration validation.
//!
//! All problems are collected and reported together so an operator
//! fixes one rehash, not one error per rehash.

use ferric_proto::validation::is_valid_sid;

use super::Config;

/// Validate a parsed config. Returns every error found.
pub fn validate(config: &Config) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.server.name.is_empty() || !config.server.name.contains('.') {
        errors.push(format!(
            "server.name {:?} must contain a dot",
            config.server.name
        ));
    }
    if !is_valid_sid(&config.server.sid) {
        errors.push(format!(
            "server.sid {:?} must be a digit followed by two uppercase id characters",
            config.server.sid
        ));
    }

    let mut seen = std::collections::HashSet::new();
    for class in &config.class {
        if !seen.insert(class.name.as_str()) {
            errors.push(format!("duplicate class {:?}", class.name));
        }
        if class.cidr_ipv4_bitlen > 32 {
            errors.push(format!(
                "class {:?}: cidr_ipv4_bitlen {} exceeds 32",
                class.name, class.cidr_ipv4_bitlen
            ));
        }
        if class.cidr_ipv6_bitlen > 128 {
            errors.push(format!(
                "class {:?}: cidr_ipv6_bitlen {} exceeds 128",
                class.name, class.cidr_ipv6_bitlen
            ));
        }
        if class.ping_frequency == 0 {
            errors.push(format!("class {:?}: ping_frequency must be > 0", class.name));
        }
    }

    for auth in &config.auth {
        if auth.user.is_empty() {
            errors.push("auth block with no user masks".to_string());
        }
        if config.class_named(&auth.class).is_none() && auth.class != "default" {
            errors.push(format!("auth block references unknown class {:?}", auth.class));
        }
        if let Some(spoof) = &auth.spoof {
            let host = spoof.split_once('@').map(|(_, h)| h).unwrap_or(spoof);
            if host.is_empty() || host.contains(' ') {
                errors.push(format!("invalid spoof {:?}", spoof));
            }
        }
    }

    for connect in &config.connect {
        if !connect.name.contains('.') {
            errors.push(format!("connect {:?}: name must contain a dot", connect.name));
        }
        if connect.send_password.is_empty() || connect.accept_password.is_empty() {
            errors.push(format!("connect {:?}: both passwords are required", connect.name));
        }
        if config.class_named(&connect.class).is_none() && connect.class != "default" {
            errors.push(format!(
                "connect {:?} references unknown class {:?}",
                connect.name, connect.class
            ));
        }
    }

    for oper in &config.operator {
        if oper.name.is_empty() {
            errors.push("operator block with no name".to_string());
        }
        if oper.user.is_empty() {
            errors.push(format!("operator {:?} has no user masks", oper.name));
        }
        if oper.password.is_empty() {
            errors.push(format!("operator {:?} has no password", oper.name));
        }
    }

    for dnsbl in &config.dnsbl {
        if !dnsbl.ipv4 && !dnsbl.ipv6 {
            errors.push(format!("dnsbl {:?} covers no address family", dnsbl.host));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
