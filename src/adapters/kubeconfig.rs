//! Kubeconfig rewriting and redaction
//!
//! Documents are handled as untyped YAML so fields this module does not care
//! about survive a rewrite untouched.

use serde_yaml::{Mapping, Value};

use crate::error::{Error, Result};

/// Placeholder replacing secret values returned to callers
pub const MASK: &str = "<secret>";

/// Exec env vars that carry AWS credentials
pub const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";

/// Credential fields of `users[*].user`
const USER_SECRETS: [&str; 3] = ["token", "password", "client-key-data"];

/// Credential keys of `users[*].user.auth-provider.config`
const AUTH_PROVIDER_SECRETS: [&str; 4] = ["access-token", "id-token", "refresh-token", "client-secret"];

const AWS_AUTHENTICATOR: &str = "aws-iam-authenticator";

/// `aws eks get-token` flags and their `aws-iam-authenticator token` equivalents
const FLAG_CONVERSIONS: [(&str, &str); 3] = [
    ("--cluster-name", "-i"),
    ("--region", "--region"),
    ("--role-arn", "-r"),
];

/// Replace an `aws` exec plugin with `aws-iam-authenticator` and inject
/// access keys into the env of `aws-iam-authenticator` execs when supplied
/// and missing.
///
/// The input is returned verbatim when nothing had to change.
pub fn replace_aws_auth(
    kubeconfig: &str,
    access_key_id: Option<&str>,
    secret_access_key: Option<&str>,
) -> Result<String> {
    if kubeconfig.trim().is_empty() {
        return Err(Error::invalid_argument("Kubeconfig can't be empty"));
    }

    let mut doc: Value = serde_yaml::from_str(kubeconfig)?;
    let mut changed = false;

    for exec in user_execs(&mut doc) {
        if exec.get("command").and_then(Value::as_str) == Some("aws") {
            let old_args: Vec<String> = exec
                .get("args")
                .and_then(Value::as_sequence)
                .map(|args| {
                    args.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();

            let mut args = vec![Value::from("token")];
            for (old, new) in FLAG_CONVERSIONS {
                if let Some(value) = flag_value(&old_args, old) {
                    args.push(Value::from(new));
                    args.push(Value::from(value));
                }
            }

            exec.insert(Value::from("command"), Value::from(AWS_AUTHENTICATOR));
            exec.insert(Value::from("args"), Value::Sequence(args));
            changed = true;
        }
        if exec.get("command").and_then(Value::as_str) != Some(AWS_AUTHENTICATOR) {
            continue;
        }

        for (name, supplied) in [
            (AWS_ACCESS_KEY_ID, access_key_id),
            (AWS_SECRET_ACCESS_KEY, secret_access_key),
        ] {
            let Some(supplied) = supplied.filter(|v| !v.is_empty()) else {
                continue;
            };
            if env_value(exec, name).map_or(false, |v| !v.is_empty()) {
                continue;
            }

            let mut entry = Mapping::new();
            entry.insert(Value::from("name"), Value::from(name));
            entry.insert(Value::from("value"), Value::from(supplied));

            match exec.get_mut("env").and_then(Value::as_sequence_mut) {
                Some(env) => env.push(Value::Mapping(entry)),
                None => {
                    exec.insert(
                        Value::from("env"),
                        Value::Sequence(vec![Value::Mapping(entry)]),
                    );
                }
            }
            changed = true;
        }
    }

    if !changed {
        return Ok(kubeconfig.to_string());
    }
    Ok(serde_yaml::to_string(&doc)?)
}

/// Copy of the kubeconfig with user credentials replaced by [`MASK`]: tokens,
/// passwords, client keys, auth-provider tokens and AWS keys in exec env.
pub fn mask_secrets(kubeconfig: &str) -> Result<String> {
    let mut doc: Value = serde_yaml::from_str(kubeconfig)?;

    for user in users(&mut doc) {
        mask_keys(user, &USER_SECRETS);
        if let Some(config) = user
            .get_mut("auth-provider")
            .and_then(|p| p.get_mut("config"))
            .and_then(Value::as_mapping_mut)
        {
            mask_keys(config, &AUTH_PROVIDER_SECRETS);
        }
    }

    for exec in user_execs(&mut doc) {
        let Some(env) = exec.get_mut("env").and_then(Value::as_sequence_mut) else {
            continue;
        };
        for entry in env.iter_mut().filter_map(Value::as_mapping_mut) {
            let secret = matches!(
                entry.get("name").and_then(Value::as_str),
                Some(AWS_ACCESS_KEY_ID) | Some(AWS_SECRET_ACCESS_KEY)
            );
            if secret {
                entry.insert(Value::from("value"), Value::from(MASK));
            }
        }
    }

    Ok(serde_yaml::to_string(&doc)?)
}

fn mask_keys(mapping: &mut Mapping, keys: &[&str]) {
    for key in keys {
        if let Some(value) = mapping.get_mut(*key) {
            *value = Value::from(MASK);
        }
    }
}

/// `users[*].user` mappings
fn users(doc: &mut Value) -> Vec<&mut Mapping> {
    doc.get_mut("users")
        .and_then(Value::as_sequence_mut)
        .map(|users| {
            users
                .iter_mut()
                .filter_map(|u| u.get_mut("user"))
                .filter_map(Value::as_mapping_mut)
                .collect()
        })
        .unwrap_or_default()
}

/// `users[*].user.exec` mappings
fn user_execs(doc: &mut Value) -> Vec<&mut Mapping> {
    users(doc)
        .into_iter()
        .filter_map(|u| u.get_mut("exec"))
        .filter_map(Value::as_mapping_mut)
        .collect()
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn env_value<'a>(exec: &'a Mapping, name: &str) -> Option<&'a str> {
    exec.get("env")?
        .as_sequence()?
        .iter()
        .find(|e| e.get("name").and_then(Value::as_str) == Some(name))
        .and_then(|e| e.get("value"))
        .and_then(Value::as_str)
}
