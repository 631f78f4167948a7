//! Trigger vocabularies.
//!
//! A trigger table maps each mode to weighted phrases. The table is read
//! from a pluggable [`TriggerSource`] and cached for a TTL; whenever the
//! source is absent, fails, or returns nothing, the built-in table is used
//! so classification always has a vocabulary.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::ai::timeout::{Timeouts, with_timeout};
use crate::storage::SqliteStateStore;
use crate::storage::database::SqlitePool;
use crate::types::{Mode, Result, RouterError, SharedClock, system_clock};

/// One weighted phrase
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    /// Lowercase phrase matched as a substring
    pub phrase: String,
    pub weight: f64,
}

impl Trigger {
    pub fn new(phrase: impl Into<String>, weight: f64) -> Self {
        Self {
            phrase: phrase.into().to_lowercase(),
            weight,
        }
    }
}

/// Phrases per mode; iteration order is the tie-break order
pub type TriggerTable = BTreeMap<Mode, Vec<Trigger>>;

// =============================================================================
// Built-in Table
// =============================================================================

const COACH: &[(&str, f64)] = &[
    ("miedo", 10.0),
    ("no puedo", 10.0),
    ("agobio", 9.0),
    ("agobiado", 9.0),
    ("bloqueo", 9.0),
    ("bloqueado", 9.0),
    ("impostor", 12.0),
    ("vergüenza", 8.0),
    ("culpa", 7.0),
    ("fracaso", 10.0),
    ("hundido", 10.0),
    ("ansiedad", 9.0),
    ("estrés", 8.0),
    ("desmotivado", 8.0),
    ("inseguro", 8.0),
    ("me siento", 5.0),
    ("no sé si puedo", 10.0),
];

const CONSULTOR: &[(&str, f64)] = &[
    ("cómo hago", 8.0),
    ("cómo puedo", 7.0),
    ("paso a paso", 10.0),
    ("tutorial", 10.0),
    ("herramienta", 6.0),
    ("configurar", 7.0),
    ("crear", 5.0),
    ("montar", 6.0),
    ("instalar", 7.0),
    ("explicame", 6.0),
    ("explícame", 6.0),
    ("qué necesito", 7.0),
    ("checklist", 9.0),
    ("pasos", 6.0),
];

const SPARRING: &[(&str, f64)] = &[
    ("qué te parece", 8.0),
    ("valídame", 9.0),
    ("validame", 9.0),
    ("practica", 9.0),
    ("practicar", 9.0),
    ("simula", 10.0),
    ("simular", 10.0),
    ("feedback", 8.0),
    ("cliente", 5.0),
    ("pitch", 10.0),
    ("inversor", 9.0),
    ("roleplay", 12.0),
    ("ensayar", 9.0),
    ("presentación", 7.0),
    ("objeción", 8.0),
    ("convencer", 6.0),
];

const CFO: &[(&str, f64)] = &[
    ("precio", 9.0),
    ("cobrar", 9.0),
    ("tarifa", 9.0),
    ("margen", 10.0),
    ("coste", 8.0),
    ("costo", 8.0),
    ("rentable", 10.0),
    ("rentabilidad", 10.0),
    ("euros", 6.0),
    ("caro", 7.0),
    ("barato", 7.0),
    ("facturar", 8.0),
    ("ingresos", 8.0),
    ("gastos", 7.0),
    ("break even", 12.0),
    ("punto de equilibrio", 12.0),
    ("unit economics", 12.0),
];

const FISCAL: &[(&str, f64)] = &[
    ("hacienda", 12.0),
    ("iva", 12.0),
    ("irpf", 12.0),
    ("modelo 303", 15.0),
    ("modelo 130", 15.0),
    ("modelo 036", 15.0),
    ("modelo 037", 15.0),
    ("factura", 8.0),
    ("declaración", 9.0),
    ("impuestos", 11.0),
    ("aeat", 12.0),
    ("verifactu", 15.0),
    ("deducible", 10.0),
    ("retención", 10.0),
    ("alta censal", 12.0),
    ("trimestre", 7.0),
];

const LABORAL: &[(&str, f64)] = &[
    ("autónomo", 10.0),
    ("cuota", 10.0),
    ("reta", 12.0),
    ("tarifa plana", 15.0),
    ("seguridad social", 12.0),
    ("cotización", 11.0),
    ("cotizar", 10.0),
    ("baja", 7.0),
    ("alta autónomo", 12.0),
    ("pluriactividad", 12.0),
    ("maternidad", 10.0),
    ("paternidad", 10.0),
    ("incapacidad", 9.0),
    ("paro", 8.0),
    ("cese actividad", 12.0),
    ("80 euros", 15.0),
];

const DEVIL: &[(&str, f64)] = &[
    ("estoy seguro", 9.0),
    ("todos quieren", 10.0),
    ("es obvio", 10.0),
    ("sin duda", 9.0),
    ("funcionará", 8.0),
    ("es único", 9.0),
    ("no hay competencia", 12.0),
    ("todo el mundo", 8.0),
    ("seguro que", 8.0),
    ("cuestiona", 10.0),
    ("desafía", 10.0),
    ("ponme a prueba", 12.0),
    ("crítica", 7.0),
];

const VPC_DESIGNER: &[(&str, f64)] = &[
    ("propuesta de valor", 15.0),
    ("value proposition", 15.0),
    ("vpc", 12.0),
    ("diferencial", 10.0),
    ("cliente objetivo", 9.0),
    ("segmento", 8.0),
    ("jobs to be done", 12.0),
    ("trabajos del cliente", 10.0),
    ("pains", 10.0),
    ("dolores", 9.0),
    ("gains", 10.0),
    ("beneficios esperados", 9.0),
    ("pain relievers", 12.0),
    ("aliviadores", 9.0),
    ("gain creators", 12.0),
    ("generadores", 8.0),
    ("encaje", 10.0),
    ("fit", 8.0),
    ("por qué elegirme", 10.0),
];

const CUSTOMER_DISCOVERY: &[(&str, f64)] = &[
    ("entrevista", 9.0),
    ("entrevistar", 9.0),
    ("salir del edificio", 15.0),
    ("sal del edificio", 15.0),
    ("get out of the building", 15.0),
    ("validar problema", 12.0),
    ("validar hipótesis", 11.0),
    ("customer discovery", 15.0),
    ("descubrimiento", 8.0),
    ("early adopter", 12.0),
    ("primeros clientes", 10.0),
    ("problema real", 10.0),
    ("hablar con clientes", 11.0),
    ("guión entrevista", 12.0),
    ("preguntas abiertas", 9.0),
    ("mom test", 12.0),
];

const PATTERN_EXPERT: &[(&str, f64)] = &[
    ("patrón de negocio", 12.0),
    ("business pattern", 12.0),
    ("modelo de negocio", 9.0),
    ("freemium", 12.0),
    ("suscripción", 10.0),
    ("marketplace", 11.0),
    ("long tail", 12.0),
    ("multi-sided", 12.0),
    ("plataforma", 8.0),
    ("open business", 10.0),
    ("navaja y cuchilla", 12.0),
    ("razor blade", 12.0),
    ("lock-in", 10.0),
    ("recurrente", 9.0),
    ("estrategia de monetización", 11.0),
];

const PIVOT_ADVISOR: &[(&str, f64)] = &[
    ("pivotar", 15.0),
    ("pivot", 15.0),
    ("cambiar de dirección", 10.0),
    ("no funciona", 9.0),
    ("replantear", 10.0),
    ("empezar de nuevo", 9.0),
    ("cambiar modelo", 11.0),
    ("explorar explotar", 12.0),
    ("explore exploit", 12.0),
    ("zoom in", 10.0),
    ("zoom out", 10.0),
    ("customer segment pivot", 12.0),
    ("value capture pivot", 12.0),
    ("channel pivot", 12.0),
    ("señales de fracaso", 10.0),
    ("métricas rojas", 11.0),
];

/// Built-in trigger table
pub fn builtin_triggers() -> TriggerTable {
    let groups: [(Mode, &[(&str, f64)]); 11] = [
        (Mode::Coach, COACH),
        (Mode::Consultor, CONSULTOR),
        (Mode::Sparring, SPARRING),
        (Mode::Cfo, CFO),
        (Mode::Fiscal, FISCAL),
        (Mode::Laboral, LABORAL),
        (Mode::Devil, DEVIL),
        (Mode::VpcDesigner, VPC_DESIGNER),
        (Mode::CustomerDiscovery, CUSTOMER_DISCOVERY),
        (Mode::PatternExpert, PATTERN_EXPERT),
        (Mode::PivotAdvisor, PIVOT_ADVISOR),
    ];

    groups
        .into_iter()
        .map(|(mode, entries)| {
            let triggers = entries
                .iter()
                .map(|(phrase, weight)| Trigger::new(*phrase, *weight))
                .collect();
            (mode, triggers)
        })
        .collect()
}

// =============================================================================
// Trigger Source
// =============================================================================

/// External provider of the trigger table
#[async_trait]
pub trait TriggerSource: Send + Sync {
    fn name(&self) -> &str;

    /// Current table; may be empty
    async fn load(&self) -> Result<TriggerTable>;
}

pub type SharedTriggerSource = Arc<dyn TriggerSource>;

/// Reads active rows of `copilot_mode_triggers`
pub struct SqliteTriggerSource {
    pool: SqlitePool,
}

impl SqliteTriggerSource {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (and initialize) the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let store = SqliteStateStore::open(path)?;
        store.initialize()?;
        Ok(Self::new(store.pool()))
    }

    /// Add one active trigger row
    pub fn insert(&self, mode: Mode, phrase: &str, weight: i64) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO copilot_mode_triggers (mode, trigger_word, weight, active) VALUES (?1, ?2, ?3, 1)",
            rusqlite::params![mode.as_str(), phrase, weight],
        )?;
        Ok(())
    }

    fn load_blocking(pool: &SqlitePool) -> Result<TriggerTable> {
        let conn = pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT mode, trigger_word, weight FROM copilot_mode_triggers
             WHERE active = 1
             ORDER BY mode, weight DESC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut table = TriggerTable::new();
        for row in rows {
            let (mode, phrase, weight) = row?;
            match mode.parse::<Mode>() {
                Ok(mode) => table
                    .entry(mode)
                    .or_default()
                    .push(Trigger::new(phrase, weight as f64)),
                Err(e) => debug!(error = %e, "Skipping trigger row with unknown mode"),
            }
        }
        Ok(table)
    }
}

#[async_trait]
impl TriggerSource for SqliteTriggerSource {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn load(&self) -> Result<TriggerTable> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || Self::load_blocking(&pool))
            .await
            .map_err(|e| RouterError::Storage(format!("Trigger load task failed: {}", e)))?
    }
}

// =============================================================================
// Cached Table
// =============================================================================

struct CachedTable {
    loaded_at: DateTime<Utc>,
    table: Arc<TriggerTable>,
}

/// TTL cache over an optional source with the built-in table as fallback
pub struct TriggerCache {
    source: Option<SharedTriggerSource>,
    ttl: Duration,
    load_timeout: std::time::Duration,
    clock: SharedClock,
    builtin: Arc<TriggerTable>,
    cached: RwLock<Option<CachedTable>>,
}

impl TriggerCache {
    pub fn new(source: Option<SharedTriggerSource>, ttl_secs: u64) -> Self {
        Self {
            source,
            ttl: Duration::seconds(ttl_secs as i64),
            load_timeout: Timeouts::default().auxiliary,
            clock: system_clock(),
            builtin: Arc::new(builtin_triggers()),
            cached: RwLock::new(None),
        }
    }

    /// Built-in table only
    pub fn builtin() -> Self {
        Self::new(None, crate::constants::classifier::TRIGGER_CACHE_TTL_SECS)
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Bound for a single source load; a slower source counts as failed
    pub fn with_load_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.load_timeout = timeout;
        self
    }

    /// Current table; never fails
    pub async fn table(&self) -> Arc<TriggerTable> {
        let Some(source) = &self.source else {
            return self.builtin.clone();
        };

        let now = self.clock.now();
        {
            let cached = self
                .cached
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(entry) = cached.as_ref()
                && now < entry.loaded_at + self.ttl
            {
                return entry.table.clone();
            }
        }

        let table = match with_timeout(self.load_timeout, source.load(), "trigger load").await {
            Ok(table) if !table.is_empty() => {
                debug!(source = source.name(), modes = table.len(), "Loaded trigger table");
                Arc::new(table)
            }
            Ok(_) => {
                debug!(source = source.name(), "Trigger source empty, using built-in table");
                self.builtin.clone()
            }
            Err(e) => {
                warn!(source = source.name(), error = %e, "Trigger source failed, using built-in table");
                // Failures are not cached so the next call retries the source
                return self.builtin.clone();
            }
        };

        let mut cached = self
            .cached
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *cached = Some(CachedTable {
            loaded_at: now,
            table: table.clone(),
        });
        table
    }

    /// Drop the cached table
    pub fn invalidate(&self) {
        let mut cached = self
            .cached
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *cached = None;
    }
}
