//! Description of provider options and resource attributes.

use serde::Serialize;
use std::fmt;

use etcdform_reconcile::{discovery, keys};
use etcdform_store::etcd::DEFAULT_ENDPOINTS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    String,
    Bool,
    Integer,
    Map,
}

/// A provider option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptionSchema {
    pub name: &'static str,
    pub kind: ValueKind,
    pub default: &'static str,
    pub description: &'static str,
    pub sensitive: bool,
}

/// A resource attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributeSchema {
    pub name: &'static str,
    pub kind: ValueKind,
    pub required: bool,
    pub description: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceSchema {
    pub name: &'static str,
    pub attributes: Vec<AttributeSchema>,
}

/// Provider options and the resource types it manages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigSchema {
    pub options: Vec<OptionSchema>,
    pub resources: Vec<ResourceSchema>,
}

const fn option(
    name: &'static str,
    kind: ValueKind,
    default: &'static str,
    description: &'static str,
) -> OptionSchema {
    OptionSchema {
        name,
        kind,
        default,
        description,
        sensitive: false,
    }
}

const fn attribute(
    name: &'static str,
    kind: ValueKind,
    required: bool,
    description: &'static str,
) -> AttributeSchema {
    AttributeSchema {
        name,
        kind,
        required,
        description,
    }
}

impl ConfigSchema {
    pub fn provider() -> Self {
        let mut password = option("password", ValueKind::String, "", "Etcd password");
        password.sensitive = true;

        Self {
            options: vec![
                option("scheme", ValueKind::String, "http", "http or https"),
                option(
                    "endpoints",
                    ValueKind::String,
                    DEFAULT_ENDPOINTS,
                    "multiple etcd endpoints separated by comma",
                ),
                option("username", ValueKind::String, "", "Etcd username"),
                password,
                option("keyfile", ValueKind::String, "", "File location keyfile"),
                option("certfile", ValueKind::String, "", "File location certfile"),
                option("cacertfile", ValueKind::String, "", "File location cacert"),
                option(
                    "insecure_skip_verify",
                    ValueKind::Bool,
                    "false",
                    "Disable verification of the server certificate",
                ),
            ],
            resources: vec![
                ResourceSchema {
                    name: keys::TYPE_NAME,
                    attributes: vec![
                        attribute("path", ValueKind::String, true, "Absolute key path"),
                        attribute("value", ValueKind::String, true, "Value of the key"),
                        attribute("ttl", ValueKind::Integer, false, "Time to live in seconds"),
                        attribute(
                            "overwrite",
                            ValueKind::Bool,
                            false,
                            "Replace an existing key on create",
                        ),
                    ],
                },
                ResourceSchema {
                    name: discovery::TYPE_NAME,
                    attributes: vec![
                        attribute("path", ValueKind::String, true, "Absolute directory path"),
                        attribute(
                            "entries",
                            ValueKind::Map,
                            false,
                            "Relative key to value; keys may contain '/' for nested nodes",
                        ),
                        attribute(
                            "ttl",
                            ValueKind::Integer,
                            false,
                            "Time to live of the directory in seconds",
                        ),
                    ],
                },
            ],
        }
    }

    pub fn option(&self, name: &str) -> Option<&OptionSchema> {
        self.options.iter().find(|o| o.name == name)
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceSchema> {
        self.resources.iter().find(|r| r.name == name)
    }
}

impl fmt::Display for ConfigSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Provider options:")?;
        for o in &self.options {
            let default = if o.default.is_empty() {
                "\"\"".to_string()
            } else {
                o.default.to_string()
            };
            writeln!(f, "  {:<22} {:<8} default {:<16} {}", o.name, kind_name(o.kind), default, o.description)?;
        }
        for r in &self.resources {
            writeln!(f)?;
            writeln!(f, "Resource {}:", r.name)?;
            for a in &r.attributes {
                let required = if a.required { "required" } else { "optional" };
                writeln!(f, "  {:<22} {:<8} {:<8} {}", a.name, kind_name(a.kind), required, a.description)?;
            }
        }
        Ok(())
    }
}

fn kind_name(kind: ValueKind) -> &'static str {
    match kind {
        ValueKind::String => "string",
        ValueKind::Bool => "bool",
        ValueKind::Integer => "integer",
        ValueKind::Map => "map",
    }
}
