//! Cluster-count diagnostics and the cluster plots.
//!
//! For each `k` in `[2, K_max]` and each restart: a GMM is fitted on each of
//! two random disjoint halves and their Jensen-Shannon distance estimated by
//! Monte-Carlo; a GMM on all points gives the silhouette score and BIC. The
//! BIC curve is differentiated per restart. Every curve is reported as mean
//! and standard deviation over restarts. All GMM work happens in a 3-D PCA
//! of the SVD coordinates.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::f64::consts::LN_2;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::clusterer::ClusterReport;
use super::gmm::{kmeans_pp, log_sum_exp, nearest_center, GaussianMixture};
use super::TicketError;
use crate::embedding::{tsne, Projection, TsneParams};
use crate::linalg::{mean, sq_dist, std_dev, vec_f64_or_nan};
use crate::plot::{Chart, Series};

pub const PCA_PLOT: &str = "ClusterPlotPCA.pdf";
pub const TSNE_PLOT: &str = "ClusterPlotTSNE.pdf";
pub const SSE_PLOT: &str = "ChooseClusterCount.pdf";
pub const JS_PLOT: &str = "DistanceBetweenGMMs.pdf";
pub const SILHOUETTE_PLOT: &str = "SilhouetteClusterCount.pdf";
pub const BIC_PLOT: &str = "GradientBicScores.pdf";

const JS_SAMPLES: usize = 1000;
const MAX_SCATTER_POINTS: usize = 300;
const KMEANS_MAX_ITER: usize = 100;

/// A curve over `k` with its spread across restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CurveStats {
    pub k: Vec<usize>,
    #[serde(deserialize_with = "vec_f64_or_nan")]
    pub mean: Vec<f64>,
    #[serde(deserialize_with = "vec_f64_or_nan")]
    pub std: Vec<f64>,
}

impl CurveStats {
    /// `runs[r][i]` is restart `r` at `ks[i]`; non-finite values are ignored.
    fn from_runs(ks: &[usize], runs: &[Vec<f64>]) -> Self {
        let mut stats = Self { k: ks.to_vec(), ..Self::default() };
        for i in 0..ks.len() {
            let column: Vec<f64> = runs.iter().filter_map(|r| r.get(i).copied()).filter(|v| v.is_finite()).collect();
            stats.mean.push(if column.is_empty() { f64::NAN } else { mean(&column) });
            stats.std.push(std_dev(&column));
        }
        stats
    }

    fn series(&self, label: &str) -> Series {
        let points = self.k.iter().zip(&self.mean).map(|(k, m)| (*k as f64, *m)).collect();
        Series::line(label, points).with_errors(self.std.clone())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    pub js_distance: CurveStats,
    pub silhouette: CurveStats,
    pub bic_gradient: CurveStats,
    pub sse: CurveStats,
    pub plots: Vec<PathBuf>,
}

/// Monte-Carlo Jensen-Shannon distance between two mixtures.
pub fn gmm_js(p: &GaussianMixture, q: &GaussianMixture, n_samples: usize, rng: &mut StdRng) -> f64 {
    let x = p.sample(n_samples, rng);
    let y = q.sample(n_samples, rng);
    if x.is_empty() || y.is_empty() {
        return f64::NAN;
    }
    let log_p_x = p.score_samples(&x);
    let log_q_x = q.score_samples(&x);
    let log_mix_x: Vec<f64> = log_p_x.iter().zip(&log_q_x).map(|(a, b)| log_sum_exp(&[*a, *b])).collect();
    let log_p_y = p.score_samples(&y);
    let log_q_y = q.score_samples(&y);
    let log_mix_y: Vec<f64> = log_p_y.iter().zip(&log_q_y).map(|(a, b)| log_sum_exp(&[*a, *b])).collect();

    let divergence = mean(&log_p_x) - (mean(&log_mix_x) - LN_2) + mean(&log_q_y) - (mean(&log_mix_y) - LN_2);
    (divergence / 2.0).max(0.0).sqrt()
}

/// Mean silhouette coefficient; zero when fewer than two labels are used.
pub fn silhouette(data: &[Vec<f64>], labels: &[usize]) -> f64 {
    let n = data.len().min(labels.len());
    let k = labels.iter().copied().max().map_or(0, |m| m + 1);
    let used = (0..k).filter(|c| labels.contains(c)).count();
    if n < 2 || used < 2 {
        return 0.0;
    }
    let scores: Vec<f64> = (0..n)
        .map(|i| {
            let mut sums = vec![0.0; k];
            let mut counts = vec![0usize; k];
            for j in 0..n {
                if i != j {
                    sums[labels[j]] += sq_dist(&data[i], &data[j]).sqrt();
                    counts[labels[j]] += 1;
                }
            }
            let own = labels[i];
            if counts[own] == 0 {
                return 0.0;
            }
            let a = sums[own] / counts[own] as f64;
            let b = (0..k)
                .filter(|c| *c != own && counts[*c] > 0)
                .map(|c| sums[c] / counts[c] as f64)
                .fold(f64::INFINITY, f64::min);
            let denom = a.max(b);
            if denom > 0.0 && b.is_finite() {
                (b - a) / denom
            } else {
                0.0
            }
        })
        .collect();
    mean(&scores)
}

/// Within-cluster sum of squares after Lloyd iterations from k-means++ seeds.
pub fn kmeans_sse(data: &[Vec<f64>], k: usize, rng: &mut StdRng) -> f64 {
    let mut centers = kmeans_pp(data, k, rng);
    if centers.is_empty() {
        return 0.0;
    }
    let mut labels = vec![usize::MAX; data.len()];
    for _ in 0..KMEANS_MAX_ITER {
        let next: Vec<usize> = data.iter().map(|x| nearest_center(x, &centers)).collect();
        if next == labels {
            break;
        }
        labels = next;
        for (j, center) in centers.iter_mut().enumerate() {
            let members: Vec<&Vec<f64>> = data.iter().zip(&labels).filter(|(_, l)| **l == j).map(|(x, _)| x).collect();
            if members.is_empty() {
                continue;
            }
            for (d, c) in center.iter_mut().enumerate() {
                *c = members.iter().map(|x| x[d]).sum::<f64>() / members.len() as f64;
            }
        }
    }
    data.iter().map(|x| sq_dist(x, &centers[nearest_center(x, &centers)])).sum()
}

/// Second-order central differences, one-sided at the ends.
pub fn gradient(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    match n {
        0 => Vec::new(),
        1 => vec![0.0],
        _ => (0..n)
            .map(|i| {
                if i == 0 {
                    values[1] - values[0]
                } else if i == n - 1 {
                    values[n - 1] - values[n - 2]
                } else {
                    (values[i + 1] - values[i - 1]) / 2.0
                }
            })
            .collect(),
    }
}

fn plot_error(path: &Path, source: std::io::Error) -> TicketError {
    TicketError::Io { path: path.to_path_buf(), source }
}

/// Evaluate cluster counts and write the six cluster PDFs into `out_dir`.
pub fn run_diagnostics(
    report: &ClusterReport,
    max_k: usize,
    restarts: usize,
    seed: u64,
    out_dir: &Path,
) -> Result<Diagnostics, TicketError> {
    let data = &report.projected;
    let n = data.len();
    let pca = Projection::fit_pca(data, 3, seed).transform_all(data, Some(3));

    let k_max = max_k.min(n / 2);
    let ks: Vec<usize> = (2..=k_max).collect();
    let mut js_runs = Vec::new();
    let mut sil_runs = Vec::new();
    let mut bic_runs = Vec::new();
    for restart in 0..restarts.max(1) {
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(restart as u64));
        let (mut js, mut sil, mut bic) = (Vec::new(), Vec::new(), Vec::new());
        for &k in &ks {
            let mut order: Vec<usize> = (0..n).collect();
            order.shuffle(&mut rng);
            let (left, right) = order.split_at(n / 2);
            let half_a: Vec<Vec<f64>> = left.iter().map(|i| pca[*i].clone()).collect();
            let half_b: Vec<Vec<f64>> = right.iter().map(|i| pca[*i].clone()).collect();

            let fits = (
                GaussianMixture::fit(&half_a, k, rng.gen(), 1),
                GaussianMixture::fit(&half_b, k, rng.gen(), 1),
                GaussianMixture::fit(&pca, k, rng.gen(), 1),
            );
            match fits {
                (Ok(a), Ok(b), Ok(full)) => {
                    js.push(gmm_js(&a, &b, JS_SAMPLES, &mut rng));
                    let labels: Vec<usize> = pca.iter().map(|x| full.predict(x)).collect();
                    sil.push(silhouette(&pca, &labels));
                    bic.push(full.bic(&pca));
                }
                _ => {
                    warn!(k, "Diagnostic fit failed");
                    js.push(f64::NAN);
                    sil.push(f64::NAN);
                    bic.push(f64::NAN);
                }
            }
        }
        debug!(restart, "Diagnostics restart done");
        js_runs.push(js);
        sil_runs.push(sil);
        bic_runs.push(gradient(&bic));
    }

    let sse_ks: Vec<usize> = (2..=max_k.min(n)).step_by(2).collect();
    let sse_runs: Vec<Vec<f64>> = (0..restarts.max(1))
        .map(|restart| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1000 + restart as u64));
            sse_ks.iter().map(|k| kmeans_sse(data, *k, &mut rng)).collect()
        })
        .collect();

    let mut diagnostics = Diagnostics {
        js_distance: CurveStats::from_runs(&ks, &js_runs),
        silhouette: CurveStats::from_runs(&ks, &sil_runs),
        bic_gradient: CurveStats::from_runs(&ks, &bic_runs),
        sse: CurveStats::from_runs(&sse_ks, &sse_runs),
        plots: Vec::new(),
    };
    diagnostics.plots = write_plots(report, &pca, &diagnostics, seed, out_dir)?;
    Ok(diagnostics)
}

fn write_plots(
    report: &ClusterReport,
    pca: &[Vec<f64>],
    diagnostics: &Diagnostics,
    seed: u64,
    out_dir: &Path,
) -> Result<Vec<PathBuf>, TicketError> {
    let mut sample: Vec<usize> = (0..pca.len()).collect();
    if sample.len() > MAX_SCATTER_POINTS {
        sample.shuffle(&mut StdRng::seed_from_u64(seed));
        sample.truncate(MAX_SCATTER_POINTS);
        sample.sort_unstable();
    }
    let components: Vec<usize> = report.assignments.iter().map(|a| a.component).collect();
    let subset: Vec<Vec<f64>> = sample.iter().map(|i| report.projected[*i].clone()).collect();
    let embedded = tsne(&subset, TsneParams { seed, ..TsneParams::default() });

    let scatter = |title: &str, coords: &dyn Fn(usize) -> (f64, f64)| {
        let mut chart = Chart::new(title, "component 1", "component 2");
        for table in &report.tables {
            let points: Vec<(f64, f64)> = sample
                .iter()
                .enumerate()
                .filter(|(_, i)| components.get(**i) == Some(&table.component))
                .map(|(pos, _)| coords(pos))
                .collect();
            chart.push(Series::scatter(table.cause.clone(), points));
        }
        chart
    };

    let mut charts = vec![
        (PCA_PLOT, scatter("Ticket clusters (PCA)", &|pos| (pca[sample[pos]][0], pca[sample[pos]][1]))),
        (TSNE_PLOT, scatter("Ticket clusters (t-SNE)", &|pos| (embedded[pos][0], embedded[pos][1]))),
    ];
    let mut curve = |file: &'static str, title: &str, y: &str, stats: &CurveStats| {
        let mut chart = Chart::new(title, "number of clusters", y);
        chart.push(stats.series(y));
        charts.push((file, chart));
    };
    curve(SSE_PLOT, "k-means SSE by cluster count", "SSE", &diagnostics.sse);
    curve(JS_PLOT, "Distance between GMMs on halves", "JS distance", &diagnostics.js_distance);
    curve(SILHOUETTE_PLOT, "Silhouette score by cluster count", "silhouette", &diagnostics.silhouette);
    curve(BIC_PLOT, "Gradient of BIC scores", "grad(BIC)", &diagnostics.bic_gradient);

    let mut written = Vec::with_capacity(charts.len());
    for (file, chart) in charts {
        let path = out_dir.join(file);
        chart.write_pdf(&path).map_err(|e| plot_error(&path, e))?;
        written.push(path);
    }
    Ok(written)
}
