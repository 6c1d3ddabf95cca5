//! Simulation scenarios.

use clap::ValueEnum;
use ledgerline_common::Currency;
use rand::rngs::StdRng;
use rand::Rng;
use serde::Serialize;

/// Workload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScenarioKind {
    /// Random same-currency transfers between random users.
    Transfers,
    /// Every operation moves money from the first user to the second.
    HotPair,
    /// Quote-then-exchange and inline-rate exchanges, with quote reuse.
    Exchanges,
    /// Transfers and exchanges interleaved.
    Mixed,
}

/// How an exchange commits to its rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateSource {
    Quote { reuse: bool },
    Inline,
}

/// One generated operation. Users are indexes into the population.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Transfer {
        from_user: usize,
        to_user: usize,
        currency: Currency,
        amount_minor: i64,
    },
    Exchange {
        user: usize,
        from: Currency,
        to: Currency,
        amount_minor: i64,
        rate: RateSource,
    },
}

/// Amount moved by every hot-pair transfer.
pub const HOT_PAIR_AMOUNT: i64 = 100;

impl ScenarioKind {
    /// Generate `count` operations over `users` users.
    pub fn plan(self, rng: &mut StdRng, users: usize, count: usize) -> Vec<Operation> {
        (0..count)
            .map(|_| match self {
                ScenarioKind::Transfers => random_transfer(rng, users),
                ScenarioKind::HotPair => Operation::Transfer {
                    from_user: 0,
                    to_user: 1,
                    currency: Currency::usd(),
                    amount_minor: HOT_PAIR_AMOUNT,
                },
                ScenarioKind::Exchanges => random_exchange(rng, users),
                ScenarioKind::Mixed => {
                    if rng.gen_bool(0.7) {
                        random_transfer(rng, users)
                    } else {
                        random_exchange(rng, users)
                    }
                }
            })
            .collect()
    }
}

fn random_currency(rng: &mut StdRng) -> Currency {
    if rng.gen_bool(0.5) {
        Currency::usd()
    } else {
        Currency::eur()
    }
}

fn random_transfer(rng: &mut StdRng, users: usize) -> Operation {
    let from_user = rng.gen_range(0..users);
    let mut to_user = rng.gen_range(0..users);
    while to_user == from_user {
        to_user = rng.gen_range(0..users);
    }
    Operation::Transfer {
        from_user,
        to_user,
        currency: random_currency(rng),
        amount_minor: rng.gen_range(1..=2_000),
    }
}

fn random_exchange(rng: &mut StdRng, users: usize) -> Operation {
    let from = random_currency(rng);
    let to = if from == Currency::usd() {
        Currency::eur()
    } else {
        Currency::usd()
    };
    let rate = if rng.gen_bool(0.7) {
        RateSource::Quote {
            reuse: rng.gen_bool(0.2),
        }
    } else {
        RateSource::Inline
    };
    Operation::Exchange {
        user: rng.gen_range(0..users),
        from,
        to,
        amount_minor: rng.gen_range(100..=5_000),
        rate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_plans_are_reproducible() {
        let a = ScenarioKind::Mixed.plan(&mut StdRng::seed_from_u64(7), 4, 50);
        let b = ScenarioKind::Mixed.plan(&mut StdRng::seed_from_u64(7), 4, 50);
        assert_eq!(a, b);
    }

    #[test]
    fn test_transfers_never_target_the_sender() {
        let plan = ScenarioKind::Transfers.plan(&mut StdRng::seed_from_u64(1), 2, 200);
        for op in plan {
            let Operation::Transfer { from_user, to_user, .. } = op else {
                panic!("transfers scenario produced an exchange");
            };
            assert_ne!(from_user, to_user);
        }
    }

    #[test]
    fn test_exchanges_cross_currencies() {
        let plan = ScenarioKind::Exchanges.plan(&mut StdRng::seed_from_u64(3), 3, 100);
        for op in plan {
            let Operation::Exchange { from, to, .. } = op else {
                panic!("exchanges scenario produced a transfer");
            };
            assert_ne!(from, to);
        }
    }
}
