use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    ConvergedGradient,
    MaxIterations,
}

impl SolveStatus {
    pub fn message(&self) -> &'static str {
        match self {
            Self::ConvergedGradient => "CONVERGENCE: NORM_OF_GRADIENT_<=_GTOL",
            Self::MaxIterations => "NO-CONVERGENCE: MAX_ITERATIONS_REACHED",
        }
    }
}

/// Per-iteration convergence history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    pub max_residual: Vec<f64>,
    pub rms_penetration: Vec<f64>,
}

impl History {
    pub(crate) fn push(&mut self, report: &IterationReport) {
        self.max_residual.push(report.max_residual);
        self.rms_penetration.push(report.rms_penetration);
    }

    pub fn len(&self) -> usize {
        self.max_residual.len()
    }

    pub fn is_empty(&self) -> bool {
        self.max_residual.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SolverStats {
    pub status: SolveStatus,
    pub iterations: usize,
    pub energy: f64,
    pub max_residual: f64,
    pub rms_penetration: f64,
    pub alpha: f64,
    pub history: Option<History>,
}

impl SolverStats {
    pub fn success(&self) -> bool {
        self.status == SolveStatus::ConvergedGradient
    }

    pub fn message(&self) -> &'static str {
        self.status.message()
    }
}

/// Scalars produced by one constrained conjugate-gradient step.
#[derive(Debug, Clone)]
pub struct IterationReport {
    /// 1-based index of the step.
    pub iteration: usize,
    /// Objective value at the projected iterate, before the update.
    pub energy: f64,
    /// Largest active-set residual magnitude.
    pub max_residual: f64,
    pub rms_penetration: f64,
    /// Active-set sum of squared residuals (G).
    pub conjugate_norm: f64,
    pub alpha: f64,
    pub active: usize,
    pub overlap: usize,
    /// The direction was reset to steepest descent.
    pub restarted: bool,
}

pub(crate) fn emit_line(line: &str) {
    if log::log_enabled!(log::Level::Info) {
        log::info!("{line}");
    } else {
        println!("{line}");
    }
}

pub trait Reporter {
    fn on_iteration(&mut self, report: &IterationReport);
    fn on_finish(&mut self) {}
}

pub struct StdoutReporter {
    rows: Vec<IterationReport>,
}

impl StdoutReporter {
    pub fn new() -> Self {
        Self { rows: Vec::new() }
    }
}

impl Default for StdoutReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for StdoutReporter {
    fn on_iteration(&mut self, report: &IterationReport) {
        self.rows.push(report.clone());
    }

    fn on_finish(&mut self) {
        if self.rows.is_empty() {
            return;
        }
        if !log::log_enabled!(log::Level::Info) {
            println!();
        }
        let mut table = Table::new();
        table.load_preset(presets::UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec![
            Cell::new("iter").set_alignment(CellAlignment::Right),
            Cell::new("energy").set_alignment(CellAlignment::Right),
            Cell::new("max res").set_alignment(CellAlignment::Right),
            Cell::new("rms pen").set_alignment(CellAlignment::Right),
            Cell::new("G").set_alignment(CellAlignment::Right),
            Cell::new("alpha").set_alignment(CellAlignment::Right),
            Cell::new("active").set_alignment(CellAlignment::Right),
            Cell::new("overlap").set_alignment(CellAlignment::Right),
            Cell::new("restart"),
        ]);
        for row in &self.rows {
            table.add_row(vec![
                Cell::new(row.iteration).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.4e}", row.energy)).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.2e}", row.max_residual)).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.2e}", row.rms_penetration))
                    .set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.2e}", row.conjugate_norm)).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.3e}", row.alpha)).set_alignment(CellAlignment::Right),
                Cell::new(row.active).set_alignment(CellAlignment::Right),
                Cell::new(row.overlap).set_alignment(CellAlignment::Right),
                Cell::new(if row.restarted { "yes" } else { "no" }),
            ]);
        }

        for line in table.to_string().lines() {
            emit_line(line);
        }
        self.rows.clear();
    }
}
