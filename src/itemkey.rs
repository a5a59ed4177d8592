//! Item key parsing: `name` or `name[param,"quoted, param",...]`.

use crate::error::{AgentError, Result};

/// Split an item key into its name and parameters.
pub fn parse(key: &str) -> Result<(String, Vec<String>)> {
    let key = key.trim();
    let Some(open) = key.find('[') else {
        validate_name(key)?;
        return Ok((key.to_string(), Vec::new()));
    };

    let name = &key[..open];
    validate_name(name)?;

    let rest = &key[open + 1..];
    let Some(body) = rest.strip_suffix(']') else {
        return Err(AgentError::application(format!(
            "Invalid item key format \"{}\": missing closing bracket.",
            key
        )));
    };

    Ok((name.to_string(), parse_params(body, key)?))
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(AgentError::application(format!(
            "Invalid item key name \"{}\".",
            name
        )))
    }
}

fn parse_params(body: &str, key: &str) -> Result<Vec<String>> {
    let invalid = || {
        AgentError::application(format!("Invalid item key format \"{}\".", key))
    };

    let mut params = Vec::new();
    let mut chars = body.chars().peekable();

    loop {
        while chars.peek() == Some(&' ') {
            chars.next();
        }

        let mut param = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' if chars.peek() == Some(&'"') => {
                        chars.next();
                        param.push('"');
                    }
                    '"' => {
                        closed = true;
                        break;
                    }
                    c => param.push(c),
                }
            }
            if !closed {
                return Err(invalid());
            }
            while chars.peek() == Some(&' ') {
                chars.next();
            }
            match chars.next() {
                None => {
                    params.push(param);
                    return Ok(params);
                }
                Some(',') => params.push(param),
                Some(_) => return Err(invalid()),
            }
        } else {
            loop {
                match chars.next() {
                    None => {
                        params.push(param);
                        return Ok(params);
                    }
                    Some(',') => break,
                    Some('"') | Some('[') | Some(']') => return Err(invalid()),
                    Some(c) => param.push(c),
                }
            }
            params.push(param);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_key() {
        let (name, params) = parse("agent.ping").unwrap();
        assert_eq!(name, "agent.ping");
        assert!(params.is_empty());
    }

    #[test]
    fn test_key_with_params() {
        let (name, params) = parse("system.cpu.load[all,avg5]").unwrap();
        assert_eq!(name, "system.cpu.load");
        assert_eq!(params, vec!["all", "avg5"]);
    }

    #[test]
    fn test_empty_and_quoted_params() {
        let (_, params) = parse(r#"web.page.get[,"a, b", "say \"hi\""]"#).unwrap();
        assert_eq!(params, vec!["", "a, b", "say \"hi\""]);

        let (_, params) = parse("system.cpu.load[]").unwrap();
        assert_eq!(params, vec![""]);
    }

    #[test]
    fn test_invalid_keys() {
        for key in ["", "bad key", "system.cpu.load[all", "k[\"open]", "k[a\"b]", "k[a]b"] {
            assert!(parse(key).is_err(), "{key:?} should be rejected");
        }
    }
}
