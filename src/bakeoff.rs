//! Two-version online A/B test (spec §4.3): alternates deployment between
//! two `CodeVersion`s, accumulates IPC observations, and applies a
//! two-sample Welch t-test to decide a winner or declare a timeout.

use once_cell::sync::Lazy;

use crate::code_version::CodeVersion;

/// One-tailed Student's-t critical values, rows keyed by the *smallest* df
/// the row applies to going up (we round df up to the next tabulated row,
/// per spec §4.3). The last row (`u32::MAX`) stands in for df = infinity.
static T_TABLE: Lazy<Vec<(u32, f64, f64)>> = Lazy::new(|| {
    vec![
        (1, 6.314, 31.821),
        (2, 2.920, 6.965),
        (3, 2.353, 4.541),
        (4, 2.132, 3.747),
        (5, 2.015, 3.365),
        (6, 1.943, 3.143),
        (7, 1.895, 2.998),
        (8, 1.860, 2.896),
        (9, 1.833, 2.821),
        (10, 1.812, 2.764),
        (11, 1.796, 2.718),
        (12, 1.782, 2.681),
        (13, 1.771, 2.650),
        (14, 1.761, 2.624),
        (15, 1.753, 2.602),
        (16, 1.746, 2.583),
        (17, 1.740, 2.567),
        (18, 1.734, 2.552),
        (19, 1.729, 2.539),
        (20, 1.725, 2.528),
        (21, 1.721, 2.518),
        (22, 1.717, 2.508),
        (23, 1.714, 2.500),
        (24, 1.711, 2.492),
        (25, 1.708, 2.485),
        (26, 1.706, 2.479),
        (27, 1.703, 2.473),
        (28, 1.701, 2.467),
        (29, 1.699, 2.462),
        (30, 1.697, 2.457),
        (40, 1.684, 2.423),
        (60, 1.671, 2.390),
        (120, 1.658, 2.358),
        (u32::MAX, 1.645, 2.326),
    ]
});

fn t_critical(df: f64, alpha: f64) -> f64 {
    let df_rounded = df.ceil().max(1.0) as u32;
    for &(row_df, a05, a01) in T_TABLE.iter() {
        if df_rounded <= row_df {
            return if alpha <= 0.01 { a01 } else { a05 };
        }
    }
    let (_, a05, a01) = *T_TABLE.last().unwrap();
    if alpha <= 0.01 { a01 } else { a05 }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WelchVerdict {
    DeployedGreater,
    DeployedLess,
    NoAnswer,
}

/// Two-sample Welch t-test, comparing `deployed` against `other`.
/// Precondition: both have at least 2 observations.
pub fn welch_test(deployed: &CodeVersion, other: &CodeVersion, alpha: f64) -> WelchVerdict {
    let mean_a = deployed.quality.mean();
    let mean_b = other.quality.mean();
    let var_a = deployed.quality.variance(mean_a);
    let var_b = other.quality.variance(mean_b);
    let n_a = deployed.quality.size() as f64;
    let n_b = other.quality.size() as f64;

    let a = var_a / n_a;
    let b = var_b / n_b;
    let denom = (a + b).sqrt();
    if denom <= 0.0 {
        return WelchVerdict::NoAnswer;
    }
    let stat = (mean_a - mean_b) / denom;

    let df = ((a + b).powi(2) / (a * a / (n_a - 1.0) + b * b / (n_b - 1.0))).floor();
    let t_crit = t_critical(df, alpha);

    let greater = stat >= t_crit;
    let less = stat <= -t_crit;
    match (greater, less) {
        (true, true) => WelchVerdict::NoAnswer,
        (true, false) => WelchVerdict::DeployedGreater,
        (false, true) => WelchVerdict::DeployedLess,
        (false, false) => WelchVerdict::NoAnswer,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BakeoffCommand {
    Deploy,
    EnableSampling,
    DisableSampling,
    SetSamplingPeriod(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BakeoffOutcome {
    InProgress,
    PayingDebt,
    NewIsBetter { winner: String },
    CurrentIsBetter { winner: String },
    Timeout { survivor: String, should_merge: bool },
}

#[derive(Debug, Clone)]
enum StoredOutcome {
    NewIsBetter { winner: String },
    CurrentIsBetter { winner: String },
}

#[derive(Debug, Clone)]
enum Phase {
    Testing,
    PayingDebt { remaining: u32, outcome: StoredOutcome },
}

#[derive(Debug, Clone, Copy)]
pub struct BakeoffParams {
    pub switch_rate: u32,
    pub max_switches: u32,
    pub min_samples: usize,
    pub confidence: f64,
    pub force_merge: bool,
    pub sampling_period: u64,
}

impl Default for BakeoffParams {
    fn default() -> Self {
        BakeoffParams {
            switch_rate: 20,
            max_switches: 6,
            min_samples: 2,
            confidence: 0.95,
            force_merge: true,
            sampling_period: 1_000_000,
        }
    }
}

pub struct Bakeoff {
    pub deployed_name: String,
    pub other_name: String,
    originally_deployed: String,
    params: BakeoffParams,
    steps_until_switch: u32,
    switches: u32,
    ticks_run: u32,
    phase: Phase,
}

impl Bakeoff {
    /// Initialization per spec §4.3: clears both versions' quality streams,
    /// deploys the current version, resets the switch countdown.
    pub fn new(
        deployed: &mut CodeVersion,
        other: &mut CodeVersion,
        deployed_name: impl Into<String>,
        other_name: impl Into<String>,
        params: BakeoffParams,
    ) -> (Self, Vec<BakeoffCommand>) {
        deployed.quality.clear();
        other.quality.clear();
        let deployed_name = deployed_name.into();
        let other_name = other_name.into();
        let bakeoff = Bakeoff {
            originally_deployed: deployed_name.clone(),
            deployed_name,
            other_name,
            steps_until_switch: params.switch_rate,
            switches: 0,
            ticks_run: 0,
            phase: Phase::Testing,
            params,
        };
        (bakeoff, vec![BakeoffCommand::Deploy])
    }

    fn alpha(&self) -> f64 {
        1.0 - self.params.confidence
    }

    /// One scheduling tick. `new_ipc` is the freshly measured IPC for the
    /// currently deployed library, if any sample arrived since the last
    /// step (spec §4.3 step 3: "If no new samples since last step, return
    /// InProgress").
    pub fn take_step(
        &mut self,
        deployed: &mut CodeVersion,
        other: &mut CodeVersion,
        new_ipc: Option<f64>,
    ) -> (BakeoffOutcome, Vec<BakeoffCommand>) {
        let mut commands = vec![BakeoffCommand::Deploy];

        if let Phase::PayingDebt { remaining, outcome } = &mut self.phase {
            commands.push(BakeoffCommand::DisableSampling);
            *remaining -= 1;
            if *remaining == 0 {
                let outcome = outcome.clone();
                let result = match outcome {
                    StoredOutcome::NewIsBetter { winner } => BakeoffOutcome::NewIsBetter { winner },
                    StoredOutcome::CurrentIsBetter { winner } => BakeoffOutcome::CurrentIsBetter { winner },
                };
                return (result, commands);
            }
            return (BakeoffOutcome::PayingDebt, commands);
        }

        commands.push(BakeoffCommand::EnableSampling);
        commands.push(BakeoffCommand::SetSamplingPeriod(self.params.sampling_period));

        self.ticks_run += 1;

        let ipc = match new_ipc {
            Some(x) => x,
            None => return (BakeoffOutcome::InProgress, commands),
        };
        deployed.quality.observe(ipc);

        if deployed.quality.size() < self.params.min_samples
            || other.quality.size() < self.params.min_samples
        {
            return (BakeoffOutcome::InProgress, commands);
        }

        match welch_test(deployed, other, self.alpha()) {
            WelchVerdict::DeployedGreater => {
                let (outcome, debt) = self.finalize_winner(true, deployed, other);
                self.enter_debt_or_finish(outcome, debt, commands)
            }
            WelchVerdict::DeployedLess => {
                let (outcome, debt) = self.finalize_winner(false, deployed, other);
                self.enter_debt_or_finish(outcome, debt, commands)
            }
            WelchVerdict::NoAnswer => {
                if self.switches >= self.params.max_switches {
                    let survivor = self.originally_deployed.clone();
                    return (
                        BakeoffOutcome::Timeout { survivor, should_merge: self.params.force_merge },
                        commands,
                    );
                }
                if self.steps_until_switch == 0 {
                    std::mem::swap(&mut self.deployed_name, &mut self.other_name);
                    self.steps_until_switch = self.params.switch_rate;
                    self.switches += 1;
                } else {
                    self.steps_until_switch -= 1;
                }
                (BakeoffOutcome::InProgress, commands)
            }
        }
    }

    fn finalize_winner(
        &self,
        deployed_wins: bool,
        deployed: &CodeVersion,
        other: &CodeVersion,
    ) -> (StoredOutcome, u32) {
        let (winner_mean, loser_mean, winner_name) = if deployed_wins {
            (deployed.quality.mean(), other.quality.mean(), self.deployed_name.clone())
        } else {
            (other.quality.mean(), deployed.quality.mean(), self.other_name.clone())
        };

        let ratio = if winner_mean.abs() > 1e-12 {
            (loser_mean / winner_mean).clamp(0.0, 1.0)
        } else {
            1.0
        };
        let debt = (((1.0 - ratio) * self.ticks_run.max(1) as f64).round().max(0.0)) as u32;

        let outcome = if winner_name == self.deployed_name {
            StoredOutcome::CurrentIsBetter { winner: winner_name }
        } else {
            StoredOutcome::NewIsBetter { winner: winner_name }
        };
        (outcome, debt)
    }

    fn enter_debt_or_finish(
        &mut self,
        outcome: StoredOutcome,
        debt: u32,
        commands: Vec<BakeoffCommand>,
    ) -> (BakeoffOutcome, Vec<BakeoffCommand>) {
        if debt == 0 {
            let result = match outcome {
                StoredOutcome::NewIsBetter { winner } => BakeoffOutcome::NewIsBetter { winner },
                StoredOutcome::CurrentIsBetter { winner } => BakeoffOutcome::CurrentIsBetter { winner },
            };
            (result, commands)
        } else {
            self.phase = Phase::PayingDebt { remaining: debt, outcome };
            (BakeoffOutcome::PayingDebt, commands)
        }
    }
}
