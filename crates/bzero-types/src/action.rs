//! Plugin action identifiers: `<plugin>/<subaction>`.
//!
//! Action names appear verbatim in `Syn` payloads and in stream routing. The
//! parsed form exists so dispatch happens on enums, never on string matching
//! outside the deserializer.

use serde::{Deserialize, Serialize};

use crate::error::TypesError;

/// The plugin half of an action identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginName {
    Db,
    Ssh,
    Shell,
    Kube,
}

impl std::fmt::Display for PluginName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PluginName::Db => "db",
            PluginName::Ssh => "ssh",
            PluginName::Shell => "shell",
            PluginName::Kube => "kube",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for PluginName {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "db" => Ok(PluginName::Db),
            "ssh" => Ok(PluginName::Ssh),
            "shell" => Ok(PluginName::Shell),
            "kube" => Ok(PluginName::Kube),
            other => Err(TypesError::UnknownPlugin(other.to_string())),
        }
    }
}

/// A parsed `<plugin>/<subaction>` identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Action {
    pub plugin: PluginName,
    pub subaction: String,
}

impl Action {
    pub fn new(plugin: PluginName, subaction: &str) -> Self {
        Self {
            plugin,
            subaction: subaction.to_string(),
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.plugin, self.subaction)
    }
}

impl std::str::FromStr for Action {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (plugin, subaction) = s
            .split_once('/')
            .ok_or_else(|| TypesError::MalformedAction(s.to_string()))?;
        if subaction.is_empty() {
            return Err(TypesError::MalformedAction(s.to_string()));
        }
        Ok(Self {
            plugin: plugin.parse()?,
            subaction: subaction.to_string(),
        })
    }
}

impl Serialize for Action {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Well-known action names.
pub mod actions {
    pub const DB_DIAL: &str = "db/dial";
    pub const DB_PWDB: &str = "db/pwdb";
    pub const SSH_OPAQUE: &str = "ssh/opaque";
    pub const SSH_TRANSPARENT: &str = "ssh/transparent";
    pub const SHELL_DEFAULT: &str = "shell/default";
    pub const KUBE_EXEC: &str = "kube/exec";
    pub const KUBE_PORTFORWARD: &str = "kube/portforward";
    pub const KUBE_STREAM: &str = "kube/stream";
    pub const KUBE_RESTAPI: &str = "kube/restapi";
}
