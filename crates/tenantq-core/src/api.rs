use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Identificador de tenant usado como clave de fairness.
///
/// Los mensajes sin tenant recuperable caen en `TenantId::DEFAULT` (0).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct TenantId(i32);

impl TenantId {
    pub const DEFAULT: TenantId = TenantId(0);

    pub fn as_i32(&self) -> i32 {
        self.0
    }
}

impl From<i32> for TenantId {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mensaje recibido de la fuente. Inmutable una vez construido.
///
/// - `id` identifica el mensaje de forma única.
/// - `ack_token` es opaco: la fuente lo usa para borrar o re-encolar.
/// - `headers` no tiene orden relevante.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    id: String,
    ack_token: String,
    payload: Vec<u8>,
    headers: HashMap<String, String>,
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        ack_token: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        headers: HashMap<String, String>,
    ) -> Self {
        Self {
            id: id.into(),
            ack_token: ack_token.into(),
            payload: payload.into(),
            headers,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn ack_token(&self) -> &str {
        &self.ack_token
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Copia del mensaje con otro token de ack (re-entrega desde la fuente).
    pub fn with_ack_token(&self, ack_token: impl Into<String>) -> Self {
        Self {
            ack_token: ack_token.into(),
            ..self.clone()
        }
    }
}

/// Entrada del buffer: el item más el tenant derivado al admitirlo.
///
/// `admitted_at` se usa para medir queue_time al momento de entregar.
#[derive(Clone, Debug)]
pub struct BufferedEntry<T> {
    pub tenant: TenantId,
    pub item: T,
    pub admitted_at: Instant,
}

impl<T> BufferedEntry<T> {
    pub fn new(tenant: TenantId, item: T) -> Self {
        Self {
            tenant,
            item,
            admitted_at: Instant::now(),
        }
    }
}

/// Qué hacer cuando la cola de un tenant está llena pero queda capacidad global.
///
/// Cuando el buffer global está lleno siempre se espera, sin importar la política.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "PolicyRepr", into = "String")]
pub enum TenantCapacityPolicy {
    /// Bloquea hasta que se libere espacio.
    #[default]
    Wait,
    /// No admite; el caller puede tratar el mensaje como consumido.
    Accept,
    /// No admite; el caller puede descartarlo o re-encolarlo.
    Skip,
}

impl TenantCapacityPolicy {
    /// Interpreta nombres (sin distinguir mayúsculas) o los ordinales 0/1/2.
    /// Cualquier otro valor cae en `Wait`.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "accept" | "1" => TenantCapacityPolicy::Accept,
            "skip" | "2" => TenantCapacityPolicy::Skip,
            _ => TenantCapacityPolicy::Wait,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TenantCapacityPolicy::Wait => "wait",
            TenantCapacityPolicy::Accept => "accept",
            TenantCapacityPolicy::Skip => "skip",
        }
    }
}

impl FromStr for TenantCapacityPolicy {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse_lenient(s))
    }
}

impl From<String> for TenantCapacityPolicy {
    fn from(value: String) -> Self {
        Self::parse_lenient(&value)
    }
}

/// Forma cruda aceptada en configuración: nombre u ordinal.
#[derive(Deserialize)]
#[serde(untagged)]
enum PolicyRepr {
    Ordinal(i64),
    Name(String),
}

impl From<PolicyRepr> for TenantCapacityPolicy {
    fn from(value: PolicyRepr) -> Self {
        match value {
            PolicyRepr::Ordinal(n) => Self::parse_lenient(&n.to_string()),
            PolicyRepr::Name(name) => Self::parse_lenient(&name),
        }
    }
}

impl From<TenantCapacityPolicy> for String {
    fn from(value: TenantCapacityPolicy) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for TenantCapacityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuración del buffer.
///
/// - `max_total` es un techo duro sobre el total de entradas.
/// - `max_per_tenant` es un techo blando, aplicado según `on_tenant_capacity`.
/// - Ambos límites se fuerzan a >= 1 al construir el buffer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    #[serde(rename = "max_buffered_messages")]
    pub max_total: usize,
    #[serde(rename = "max_buffered_messages_per_tenant")]
    pub max_per_tenant: usize,
    pub on_tenant_capacity: TenantCapacityPolicy,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_total: 64,
            max_per_tenant: 4,
            on_tenant_capacity: TenantCapacityPolicy::Wait,
        }
    }
}

/// Motivo por el cual una entrada no fue admitida (según la política).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NotAdmittedReason {
    /// Política `Accept`: tratar como consumido.
    Accept,
    /// Política `Skip`: descartar o re-encolar aguas arriba.
    Skip,
}

/// Resultado final de una admisión.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AdmitResult {
    Admitted,
    NotAdmitted(NotAdmittedReason),
}

/// Resultado de un intento no bloqueante de admisión.
///
/// `Full` devuelve la entrada para que el caller espere y reintente.
#[derive(Debug)]
pub enum AdmitAttempt<T> {
    Admitted,
    NotAdmitted(NotAdmittedReason),
    Full(BufferedEntry<T>, FullReason),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FullReason {
    /// Capacidad global agotada.
    GlobalFull,
    /// Cola del tenant llena con política `Wait`.
    TenantFull,
}

#[derive(Clone, Debug, Default)]
pub struct BufferStats {
    /// Total de entradas admitidas.
    pub admitted: u64,
    /// Total de entradas entregadas a consumidores.
    pub dequeued: u64,
    /// Admisiones rechazadas con política `Accept`.
    pub not_admitted_accept: u64,
    /// Admisiones rechazadas con política `Skip`.
    pub not_admitted_skip: u64,
    /// Entradas en buffer al momento del snapshot.
    pub buffered: u64,
    /// Tenants con al menos una entrada.
    pub active_tenants: u64,
    /// Suma acumulada del queue_time (nanosegundos) de entradas entregadas.
    pub queue_time_sum_ns: u64,
    /// Número de muestras acumuladas para `queue_time_sum_ns`.
    pub queue_time_samples: u64,
    /// Profundidad por tenant activo, en orden de rotación.
    pub tenant_depths: Vec<TenantDepth>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TenantDepth {
    pub tenant: TenantId,
    pub depth: u64,
}
