use serde::{Deserialize, Serialize};

/// Parámetros inmutables de una corrida de mantenimiento.
///
/// La igualdad completa del contexto decide si un registro existente sirve
/// para la corrida actual o si hay que reemplazarlo.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MaintenanceContext {
    pub nodes: Vec<String>,
    pub key_spaces: Vec<String>,
    pub column_families: Vec<String>,

    /// Sólo para backup / restore.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_location: Option<String>,
}

impl MaintenanceContext {
    pub fn create(nodes: Vec<String>, key_spaces: Vec<String>, column_families: Vec<String>) -> Self {
        Self {
            nodes,
            key_spaces,
            column_families,
            backup_name: None,
            external_location: None,
        }
    }

    pub fn with_backup(mut self, name: impl Into<String>, location: impl Into<String>) -> Self {
        self.backup_name = Some(name.into());
        self.external_location = Some(location.into());
        self
    }

    /// `true` si la lista de nodos pide todos los nodos ("*").
    pub fn all_nodes(&self) -> bool {
        self.nodes.iter().any(|n| n == "*")
    }
}
