use crate::config::BenchmarkConfig;
use crate::error::ConfigError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use url::Url;

/// Picks the target URL of each request in multi-task mode.
///
/// Tasks are tried in configuration order against one uniform draw; the
/// probability mass they leave over goes to the primary URL.
#[derive(Debug, Clone)]
pub struct RequestMix {
    primary: Url,
    tasks: Vec<(Url, f64)>,
    rng: StdRng,
}

impl RequestMix {
    pub fn new(config: &BenchmarkConfig, connection: usize) -> Result<Self, ConfigError> {
        let primary = config.target()?;
        let tasks = config
            .tasks
            .iter()
            .map(|t| {
                Url::parse(&t.url)
                    .map(|url| (url, t.probability))
                    .map_err(|e| ConfigError::Url {
                        url: t.url.clone(),
                        reason: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            primary,
            tasks,
            rng: StdRng::seed_from_u64(config.seed.wrapping_add(connection as u64)),
        })
    }

    pub fn primary(&self) -> &Url {
        &self.primary
    }

    pub fn next_url(&mut self) -> &Url {
        if self.tasks.is_empty() {
            return &self.primary;
        }
        let draw: f64 = self.rng.gen();
        let mut cumulative = 0.0;
        for (url, probability) in &self.tasks {
            cumulative += probability;
            if draw < cumulative {
                return url;
            }
        }
        &self.primary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskConfig;
    use crate::pacing::PacingModel;

    fn config(tasks: Vec<TaskConfig>) -> BenchmarkConfig {
        BenchmarkConfig {
            threads: 1,
            connections: 1,
            url: "http://localhost/main".to_string(),
            duration_secs: 1,
            warm_up_secs: 0,
            rate: 0.0,
            timeout_ms: None,
            pacing: PacingModel::Closed,
            seed: 42,
            tasks,
            drain_timeout_ms: 0,
        }
    }

    #[test]
    fn test_single_task_always_primary() {
        let mut mix = RequestMix::new(&config(vec![]), 0).unwrap();
        for _ in 0..10 {
            assert_eq!(mix.next_url().path(), "/main");
        }
    }

    #[test]
    fn test_weights_are_respected() {
        let tasks = vec![TaskConfig {
            url: "http://localhost/side".to_string(),
            probability: 0.25,
        }];
        let mut mix = RequestMix::new(&config(tasks), 3).unwrap();

        let side = (0..10_000)
            .filter(|_| mix.next_url().path() == "/side")
            .count();
        assert!((2_200..=2_800).contains(&side), "side: {}", side);
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let tasks = vec![TaskConfig {
            url: "http://localhost/side".to_string(),
            probability: 0.5,
        }];
        let cfg = config(tasks);
        let mut a = RequestMix::new(&cfg, 1).unwrap();
        let mut b = RequestMix::new(&cfg, 1).unwrap();
        for _ in 0..100 {
            assert_eq!(a.next_url(), b.next_url());
        }
    }
}
