//! Configuração do convoy carregada a partir de `convoy.toml`.
//!
//! A struct [`ConvoyConfig`] contém todos os parâmetros configuráveis,
//! agrupados por componente. Valores não presentes no arquivo usam defaults
//! sensíveis. As variáveis de ambiente `CONVOY_MAX_CONCURRENCY` e
//! `CONVOY_POOL_CAPACITY` têm precedência sobre o arquivo.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConvoyError;

/// Nome do arquivo de configuração procurado no diretório atual.
pub const CONFIG_FILE: &str = "convoy.toml";

/// Configuração de nível superior carregada de `convoy.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConvoyConfig {
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub prefetch: PrefetchConfig,
    #[serde(default)]
    pub challenge: ChallengeConfig,
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
    #[serde(default)]
    pub finalize: FinalizeConfig,
}

/// Parâmetros do escalonador adaptativo de lotes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Tamanho de lote inicial.
    #[serde(default = "default_initial")]
    pub initial: usize,
    /// Piso da concorrência após reduções.
    #[serde(default = "default_min")]
    pub min: usize,
    /// Teto da concorrência após aumentos.
    #[serde(default = "default_max")]
    pub max: usize,
    /// Teto de tentativas = alvo × multiplicador.
    #[serde(default = "default_attempt_multiplier")]
    pub attempt_multiplier: u32,
    /// Taxa de sucesso do lote acima da qual a concorrência sobe.
    #[serde(default = "default_raise_above")]
    pub raise_above: f64,
    /// Taxa de sucesso do lote abaixo da qual a concorrência desce.
    #[serde(default = "default_lower_below")]
    pub lower_below: f64,
}

impl ConcurrencyConfig {
    /// Limites, multiplicador e limiares. NaN fica fora de [0, 1] e é rejeitado.
    pub fn validate(&self) -> Result<(), ConvoyError> {
        if self.min == 0 {
            return Err(ConvoyError::Config("concurrency.min must be at least 1".into()));
        }
        if self.min > self.max {
            return Err(ConvoyError::Config(format!(
                "concurrency.min ({}) exceeds concurrency.max ({})",
                self.min, self.max
            )));
        }
        if self.attempt_multiplier == 0 {
            return Err(ConvoyError::Config(
                "concurrency.attempt_multiplier must be at least 1".into(),
            ));
        }
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(self.raise_above)
            || !in_unit(self.lower_below)
            || self.lower_below > self.raise_above
        {
            return Err(ConvoyError::Config(format!(
                "invalid thresholds: lower_below={} raise_above={}",
                self.lower_below, self.raise_above
            )));
        }
        Ok(())
    }
}

/// Parâmetros do pool de sessões.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Número máximo de sessões vivas (livres + em uso).
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

/// Parâmetros da fila de pré-busca de credenciais.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetchConfig {
    /// Profundidade alvo da fila.
    #[serde(default = "default_depth")]
    pub depth: usize,
    /// Intervalo do laço de manutenção em milissegundos.
    #[serde(default = "default_refill_interval_ms")]
    pub refill_interval_ms: u64,
}

/// Origem das respostas para o desafio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolverMode {
    /// Resolvedor automático, melhor esforço.
    Auto,
    /// Operador humano via canal de retransmissão.
    Human,
}

/// Parâmetros do laço de resolução do desafio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeConfig {
    #[serde(default = "default_mode")]
    pub mode: SolverMode,
    /// Número de rodadas de desafio.
    #[serde(default = "default_rounds")]
    pub rounds: u32,
    /// Tentativas de resolução por rodada.
    #[serde(default = "default_attempts_per_round")]
    pub attempts_per_round: u32,
    /// Tempo máximo de espera por uma resposta humana, em segundos.
    #[serde(default = "default_human_timeout_secs")]
    pub human_timeout_secs: u64,
    /// Quantas vezes as heurísticas de sucesso são verificadas após cada envio.
    #[serde(default = "default_signal_checks")]
    pub signal_checks: u32,
    /// Intervalo entre verificações de heurística, em milissegundos.
    #[serde(default = "default_signal_interval_ms")]
    pub signal_interval_ms: u64,
}

/// Parâmetros da espera pelo código de confirmação.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationConfig {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Número máximo de consultas antes de desistir.
    #[serde(default = "default_max_probes")]
    pub max_probes: u32,
}

/// Parâmetros da interpretação do reconhecimento final.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeConfig {
    #[serde(default = "default_settle_checks")]
    pub settle_checks: u32,
    #[serde(default = "default_settle_interval_ms")]
    pub settle_interval_ms: u64,
    /// Trata a ausência de qualquer sinal negativo como sucesso.
    #[serde(default = "default_assume_success")]
    pub assume_success_on_silence: bool,
}

fn default_initial() -> usize {
    3
}

fn default_min() -> usize {
    2
}

fn default_max() -> usize {
    6
}

fn default_attempt_multiplier() -> u32 {
    8
}

fn default_raise_above() -> f64 {
    0.75
}

fn default_lower_below() -> f64 {
    0.35
}

fn default_capacity() -> usize {
    8
}

fn default_depth() -> usize {
    3
}

fn default_refill_interval_ms() -> u64 {
    250
}

fn default_mode() -> SolverMode {
    SolverMode::Auto
}

fn default_rounds() -> u32 {
    2
}

fn default_attempts_per_round() -> u32 {
    3
}

// Dois minutos, como um operador leva para responder.
fn default_human_timeout_secs() -> u64 {
    120
}

fn default_signal_checks() -> u32 {
    4
}

fn default_signal_interval_ms() -> u64 {
    500
}

fn default_initial_backoff_ms() -> u64 {
    800
}

fn default_max_backoff_ms() -> u64 {
    4000
}

fn default_max_probes() -> u32 {
    45
}

fn default_settle_checks() -> u32 {
    6
}

fn default_settle_interval_ms() -> u64 {
    500
}

fn default_assume_success() -> bool {
    true
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            initial: default_initial(),
            min: default_min(),
            max: default_max(),
            attempt_multiplier: default_attempt_multiplier(),
            raise_above: default_raise_above(),
            lower_below: default_lower_below(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            depth: default_depth(),
            refill_interval_ms: default_refill_interval_ms(),
        }
    }
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            rounds: default_rounds(),
            attempts_per_round: default_attempts_per_round(),
            human_timeout_secs: default_human_timeout_secs(),
            signal_checks: default_signal_checks(),
            signal_interval_ms: default_signal_interval_ms(),
        }
    }
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_probes: default_max_probes(),
        }
    }
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        Self {
            settle_checks: default_settle_checks(),
            settle_interval_ms: default_settle_interval_ms(),
            assume_success_on_silence: default_assume_success(),
        }
    }
}

impl ChallengeConfig {
    pub fn human_timeout(&self) -> Duration {
        Duration::from_secs(self.human_timeout_secs)
    }

    pub fn signal_interval(&self) -> Duration {
        Duration::from_millis(self.signal_interval_ms)
    }
}

impl ConfirmationConfig {
    /// Atraso antes da consulta `probe` (começando em 1), com backoff
    /// exponencial limitado: `min(inicial * 2^(probe - 1), máximo)`.
    pub fn delay_for_probe(&self, probe: u32) -> Duration {
        let factor = 2u64.saturating_pow(probe.saturating_sub(1));
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

impl FinalizeConfig {
    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms)
    }
}

impl ConvoyConfig {
    /// Carrega a configuração de `convoy.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self, ConvoyError> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Carrega a configuração de um caminho explícito.
    pub fn load_from(path: &Path) -> Result<Self, ConvoyError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<ConvoyConfig>(&contents)?
        } else {
            Self::default()
        };

        // Variáveis de ambiente têm precedência sobre o arquivo.
        if let Some(max) = env_usize("CONVOY_MAX_CONCURRENCY") {
            config.concurrency.max = max;
        }
        if let Some(capacity) = env_usize("CONVOY_POOL_CAPACITY") {
            config.pool.capacity = capacity;
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejeita combinações que tornariam o escalonador ou o laço de desafio inúteis.
    pub fn validate(&self) -> Result<(), ConvoyError> {
        let c = &self.concurrency;
        c.validate()?;
        if self.pool.capacity < c.max {
            return Err(ConvoyError::Config(format!(
                "pool.capacity ({}) must be at least concurrency.max ({})",
                self.pool.capacity, c.max
            )));
        }
        if self.challenge.rounds == 0 || self.challenge.attempts_per_round == 0 {
            return Err(ConvoyError::Config(
                "challenge.rounds and challenge.attempts_per_round must be at least 1".into(),
            ));
        }
        if self.confirmation.max_probes == 0 {
            return Err(ConvoyError::Config(
                "confirmation.max_probes must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = ConvoyConfig::default();
        assert_eq!(config.concurrency.initial, 3);
        assert_eq!(config.concurrency.min, 2);
        assert_eq!(config.concurrency.attempt_multiplier, 8);
        assert_eq!(config.challenge.rounds, 2);
        assert_eq!(config.challenge.attempts_per_round, 3);
        assert_eq!(config.challenge.human_timeout(), Duration::from_secs(120));
        assert_eq!(config.challenge.mode, SolverMode::Auto);
        assert!(config.finalize.assume_success_on_silence);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            [concurrency]
            max = 10

            [pool]
            capacity = 12

            [challenge]
            mode = "human"
        "#;
        let config: ConvoyConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.concurrency.max, 10);
        assert_eq!(config.concurrency.min, 2);
        assert_eq!(config.pool.capacity, 12);
        assert_eq!(config.challenge.mode, SolverMode::Human);
        assert_eq!(config.challenge.rounds, 2);
        assert_eq!(config.prefetch.depth, 3);
    }

    #[test]
    fn confirmation_backoff_is_capped() {
        let config = ConfirmationConfig::default();
        assert_eq!(config.delay_for_probe(1), Duration::from_millis(800));
        assert_eq!(config.delay_for_probe(2), Duration::from_millis(1600));
        assert_eq!(config.delay_for_probe(3), Duration::from_millis(3200));
        assert_eq!(config.delay_for_probe(4), Duration::from_millis(4000));
        assert_eq!(config.delay_for_probe(40), Duration::from_millis(4000));
    }

    #[test]
    fn validate_rejects_small_pool() {
        let mut config = ConvoyConfig::default();
        config.pool.capacity = 2;
        assert!(matches!(config.validate(), Err(ConvoyError::Config(_))));
    }

    #[test]
    fn validate_rejects_inverted_thresholds() {
        let mut config = ConvoyConfig::default();
        config.concurrency.lower_below = 0.9;
        config.concurrency.raise_above = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_nan_threshold() {
        let mut config = ConvoyConfig::default();
        config.concurrency.raise_above = f64::NAN;
        assert!(matches!(
            config.concurrency.validate(),
            Err(ConvoyError::Config(ref m)) if m.contains("thresholds")
        ));
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_rounds() {
        let mut config = ConvoyConfig::default();
        config.challenge.rounds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("convoy.toml");
        std::fs::write(&path, "[prefetch]\ndepth = 5\n").unwrap();
        let config = ConvoyConfig::load_from(&path).unwrap();
        assert_eq!(config.prefetch.depth, 5);
    }

    #[test]
    fn load_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConvoyConfig::load_from(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.challenge.rounds, 2);
    }
}
