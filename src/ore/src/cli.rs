// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Command-line parsing utilities.

use std::fmt::Display;
use std::str::FromStr;

use clap::{ArgMatches, Parser};

/// A help template for use with clap that does not include the name of the
/// binary or the version in the help output.
const NO_VERSION_HELP_TEMPLATE: &str = "{about}

USAGE:
    {usage}

{all-args}";

/// Configures [`parse_args`].
#[derive(Debug, Clone, Default)]
pub struct CliConfig<'a> {
    /// If set, every long option that does not declare its own environment
    /// variable falls back to `<PREFIX><OPTION_NAME>`, with dashes replaced
    /// by underscores and the name uppercased.
    pub env_prefix: Option<&'a str>,
    /// Whether to keep clap's `--version` flag.
    pub enable_version_flag: bool,
}

/// Parses command-line arguments according to a clap `Parser` after
/// applying the shared customizations described by `config`.
pub fn parse_args<O>(config: CliConfig<'_>) -> O
where
    O: Parser,
{
    let mut clap = O::command()
        .args_override_self(true)
        .help_template(NO_VERSION_HELP_TEMPLATE);
    if !config.enable_version_flag {
        clap = clap.disable_version_flag(true);
    }
    if let Some(prefix) = config.env_prefix {
        clap = clap.mut_args(|arg| match (arg.get_long(), arg.get_env()) {
            (Some(long), None) => {
                // clap only accepts `'static` names here; this runs once at
                // startup for a bounded set of options.
                let name: &'static str = Box::leak(env_var_name(prefix, long).into_boxed_str());
                arg.env(name)
            }
            _ => arg,
        });
    }
    let matches: ArgMatches = clap.get_matches();
    O::from_arg_matches(&matches).unwrap_or_else(|e| e.exit())
}

fn env_var_name(prefix: &str, long: &str) -> String {
    format!("{prefix}{}", long.replace('-', "_").to_uppercase())
}

/// A command-line argument of the form `KEY=VALUE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValueArg<K, V> {
    /// The key of the command-line argument.
    pub key: K,
    /// The value of the command-line argument.
    pub value: V,
}

impl<K, V> FromStr for KeyValueArg<K, V>
where
    K: FromStr,
    K::Err: Display,
    V: FromStr,
    V::Err: Display,
{
    type Err = String;

    fn from_str(s: &str) -> Result<KeyValueArg<K, V>, String> {
        let mut parts = s.splitn(2, '=');
        let key = parts.next().unwrap_or_default();
        let value = parts
            .next()
            .ok_or_else(|| "must have format KEY=VALUE".to_string())?;
        Ok(KeyValueArg {
            key: key.parse().map_err(|e| format!("parsing key: {}", e))?,
            value: value.parse().map_err(|e| format!("parsing value: {}", e))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{env_var_name, KeyValueArg};

    #[test]
    fn test_key_value_arg() {
        let arg: KeyValueArg<String, String> = "app=mysql".parse().unwrap();
        assert_eq!(arg.key, "app");
        assert_eq!(arg.value, "mysql");

        let arg: KeyValueArg<String, String> = "selector=a=b".parse().unwrap();
        assert_eq!(arg.key, "selector");
        assert_eq!(arg.value, "a=b");

        assert!("novalue".parse::<KeyValueArg<String, String>>().is_err());
    }

    #[test]
    fn test_env_var_name() {
        assert_eq!(
            env_var_name("RDS_AGENT_", "sync-interval"),
            "RDS_AGENT_SYNC_INTERVAL"
        );
    }
}
