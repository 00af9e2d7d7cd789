//! Address parsing and comparison helpers

/// Extract the bare, lowercased address from `Name <addr>` or `addr`
///
/// Falls back to angle-bracket stripping when mailparse rejects the input.
pub fn bare_address(raw: &str) -> String {
    if let Ok(addrs) = mailparse::addrparse(raw) {
        for addr in addrs.iter() {
            match addr {
                mailparse::MailAddr::Single(info) => return info.addr.trim().to_lowercase(),
                mailparse::MailAddr::Group(group) => {
                    if let Some(member) = group.addrs.first() {
                        return member.addr.trim().to_lowercase();
                    }
                }
            }
        }
    }

    if let (Some(start), Some(end)) = (raw.rfind('<'), raw.rfind('>')) {
        if end > start {
            return raw[start + 1..end].trim().to_lowercase();
        }
    }
    raw.trim().to_lowercase()
}

/// Identity key used to decide whether two addresses reach the same mailbox
pub fn normalize_email(email: &str) -> String {
    let email = bare_address(email);

    let Some((local, domain)) = email.split_once('@') else {
        return email;
    };

    // Strip +tag subaddressing (Gmail, Outlook, Fastmail, etc.)
    let local = match local.split_once('+') {
        Some((base, _)) => base,
        None => local,
    };

    // Strip dots from local part for Gmail/Googlemail
    let local = if domain == "gmail.com" || domain == "googlemail.com" {
        local.replace('.', "")
    } else {
        local.to_string()
    };

    format!("{}@{}", local, domain)
}

/// Whether `addr` belongs to any of `own`
pub fn is_own_address(addr: &str, own: &[String]) -> bool {
    let key = normalize_email(addr);
    own.iter().any(|o| normalize_email(o) == key)
}
