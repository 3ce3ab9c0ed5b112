use thiserror::Error;

use crate::step::Status;
use crate::task::TaskType;

/// Errores del motor de planes.
///
/// "Nodo no listo" no aparece acá: no es un error, `start()` simplemente
/// devuelve `None` y el loop externo reintenta en el próximo ciclo.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    /// No hay plantilla de recursos para este tipo de tarea (error de configuración).
    #[error("tipo de tarea no soportado: {0}")]
    UnsupportedTaskType(TaskType),

    /// El loop externo llamó `start()` sobre un step que no está PENDING.
    #[error("transición ilegal: step {step} está en {status:?}")]
    IllegalStateTransition { step: String, status: Status },

    #[error("la tarea {step} falló: {message}")]
    ExecutionFailed { step: String, message: String },

    #[error("step desconocido: {0}")]
    UnknownStep(String),

    #[error("error de almacenamiento: {0}")]
    Store(String),
}
