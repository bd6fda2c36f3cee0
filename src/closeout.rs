//! Close-out statistics.
//!
//! Once the stepper finishes, the close-out derives everything the caller
//! sees besides the hypocenter itself: azimuthal gaps, marginal 90 %
//! errors, the error ellipsoid, per-pick data importances, and the quality
//! grade.

use nalgebra::{Matrix2, Matrix3, SymmetricEigen, Vector3};
use tracing::{debug, warn};

use crate::config::LocatorConfig;
use crate::estimator::RankSumEstimator;
use crate::event::Event;
use crate::geo::KM_PER_DEG;
use crate::status::LocStatus;

/// One principal axis of the error ellipsoid.
#[derive(Debug, Clone, Copy, Default)]
pub struct EllipseAxis {
    /// Semi-axis length (km).
    pub semi_len: f64,
    /// Azimuth of the axis (deg clockwise from north).
    pub azimuth: f64,
    /// Plunge below horizontal (deg, non-negative).
    pub plunge: f64,
}

/// The 90 % error ellipsoid.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorEllipse {
    /// Axes sorted by descending semi-length.
    pub axes: [EllipseAxis; 3],
    /// Largest horizontal projection of any axis (km).
    pub max_horizontal: f64,
    /// Largest vertical projection of any axis (km).
    pub max_vertical: f64,
    /// Equivalent horizontal radius from the two longest axes (km).
    pub equivalent_radius: f64,
}

/// Everything close-out computes.
#[derive(Debug, Clone)]
pub struct CloseoutSummary {
    pub azimuthal_gap: f64,
    pub robust_gap: f64,
    /// Residuals standard error (s).
    pub std_error: f64,
    /// 90 % marginal origin-time error (s).
    pub time_error: f64,
    /// 90 % marginal position errors (km).
    pub latitude_error: f64,
    pub longitude_error: f64,
    pub depth_error: f64,
    pub ellipse: ErrorEllipse,
    /// Importance of the Bayesian depth constraint.
    pub bayes_importance: f64,
    pub quality: char,
    /// Terminal status, possibly downgraded by numerical failures here.
    pub status: LocStatus,
}

impl Default for CloseoutSummary {
    fn default() -> Self {
        Self {
            azimuthal_gap: 360.0,
            robust_gap: 360.0,
            std_error: 0.0,
            time_error: 0.0,
            latitude_error: 0.0,
            longitude_error: 0.0,
            depth_error: 0.0,
            ellipse: ErrorEllipse::default(),
            bayes_importance: 0.0,
            quality: 'D',
            status: LocStatus::Success,
        }
    }
}

/// Compute the close-out for a finished event. Pick importances are written
/// back into the event's picks.
pub fn close_out(event: &mut Event, status: LocStatus, cfg: &LocatorConfig) -> CloseoutSummary {
    let mut summary = CloseoutSummary {
        status,
        quality: 'D',
        ..CloseoutSummary::default()
    };

    let (gap, robust) = azimuthal_gaps(event);
    summary.azimuthal_gap = gap;
    summary.robust_gap = robust;

    if !status.has_solution() {
        // Terminal data failures zero every statistic; the supporting
        // picks go back out as they came in.
        for pick in &mut event.picks {
            pick.weight = 0.0;
            pick.importance = 0.0;
            pick.residual = 0.0;
            pick.is_used = false;
        }
        summary.azimuthal_gap = 360.0;
        summary.robust_gap = 360.0;
        return summary;
    }

    // Residuals standard error from the estimator spread.
    summary.std_error = {
        let mut rows = event.residuals.clone();
        let mut rse = RankSumEstimator::new();
        let _ = rse.median(&mut rows);
        rse.spread(&rows, cfg.estimator.mad_norm)
    };

    // The last iteration may have rebuilt the rows after its statistics
    // pass; re-establish the demedianed design state they are quoted in.
    {
        let Event {
            rse_raw, residuals, ..
        } = event;
        let (_, anchor) = rse_raw.median(residuals);
        rse_raw.demedian_residuals(residuals);
        rse_raw.demedian_design_matrix(residuals, anchor);
    }
    if event.use_decorrelation && event.projected.len() >= 2 {
        let Event {
            rse_proj,
            projected,
            ..
        } = event;
        let (_, anchor) = rse_proj.median(projected);
        rse_proj.demedian_residuals(projected);
        rse_proj.demedian_design_matrix(projected, anchor);
    }

    // Errors are always quoted with three spatial degrees of freedom, even
    // when depth was held.
    let n_used = event.picks_used();
    let comp = if event.use_decorrelation {
        1.0
    } else {
        (cfg.closeout.eff_offset - cfg.closeout.eff_slope * ((n_used + 1) as f64).log10())
            .max(1.0)
            .sqrt()
    };

    // Normal matrix from the demedianed weighted derivatives, projected
    // rows when decorrelating.
    let rows = if event.use_decorrelation && !event.projected.is_empty() {
        &event.projected
    } else {
        &event.residuals
    };
    let mut normal = Matrix3::<f64>::zeros();
    for row in rows {
        let w2 = row.weight * row.weight;
        for i in 0..3 {
            for j in 0..3 {
                normal[(i, j)] += w2 * row.demed_deriv[i] * row.demed_deriv[j];
            }
        }
    }

    let Some(covariance) = normal.try_inverse() else {
        warn!("close-out normal matrix is singular");
        for pick in &mut event.picks {
            pick.importance = 0.0;
            pick.weight = 0.0;
        }
        summary.status = LocStatus::SingularMatrix;
        summary.std_error = 0.0;
        return summary;
    };

    let scale_1d = cfg.closeout.perpt_1d / comp;
    summary.time_error = scale_1d * summary.std_error;
    summary.latitude_error = scale_1d * covariance[(0, 0)].max(0.0).sqrt();
    summary.longitude_error = scale_1d * covariance[(1, 1)].max(0.0).sqrt();
    summary.depth_error = scale_1d * covariance[(2, 2)].max(0.0).sqrt();

    // Errors are reported with three degrees of freedom even for held
    // hypocenters; only an analyst-held depth reduces the ellipsoid.
    let error_dof = if event.is_depth_held && !event.is_location_held {
        2
    } else {
        3
    };
    match error_ellipse(&covariance, error_dof, comp, cfg) {
        Some(ellipse) => summary.ellipse = ellipse,
        None => {
            warn!("error ellipsoid eigendecomposition failed");
            summary.status = LocStatus::EllipsoidFailed;
        }
    }

    // Importances from the actual (un-demedianed) normal matrix over the
    // raw weighted derivatives.
    let mut actual = Matrix3::zeros();
    for row in &event.residuals {
        let w2 = row.weight * row.weight;
        for i in 0..3 {
            for j in 0..3 {
                actual[(i, j)] += w2 * row.deriv[i] * row.deriv[j];
            }
        }
    }
    if let Some(actual_cov) = actual.try_inverse() {
        for row in &event.residuals {
            let d = Vector3::new(row.deriv[0], row.deriv[1], row.deriv[2]);
            let importance = row.weight * row.weight * (d.transpose() * actual_cov * d)[(0, 0)];
            match row.pick {
                Some(p) => event.picks[p].importance = importance.max(0.0),
                None if row.is_bayesian_depth => {
                    summary.bayes_importance =
                        (actual_cov[(2, 2)] * row.weight * row.weight).max(0.0);
                }
                None => {}
            }
        }
    }

    summary.quality = quality_grade(event, &summary, cfg);
    debug!(
        gap = summary.azimuthal_gap,
        robust = summary.robust_gap,
        std_error = summary.std_error,
        quality = %summary.quality,
        "close-out complete"
    );
    summary
}

/// Azimuthal gap and robust (secondary) gap over the used stations.
/// Both are 360 when one station or fewer is used.
fn azimuthal_gaps(event: &Event) -> (f64, f64) {
    let mut azimuths: Vec<f64> = event
        .groups
        .iter()
        .filter(|g| g.picks.iter().any(|&p| event.picks[p].is_used))
        .map(|g| g.azimuth_deg)
        .collect();
    if azimuths.len() <= 1 {
        return (360.0, 360.0);
    }
    azimuths.sort_by(f64::total_cmp);

    let gap = max_gap(&azimuths);
    // Secondary gap: the widest gap seen when any single station is removed.
    let mut robust = gap;
    for skip in 0..azimuths.len() {
        let reduced: Vec<f64> = azimuths
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != skip)
            .map(|(_, &a)| a)
            .collect();
        if reduced.len() <= 1 {
            robust = 360.0;
            break;
        }
        robust = robust.max(max_gap(&reduced));
    }
    (gap, robust)
}

/// Largest angular gap on the unit circle; input sorted ascending.
fn max_gap(sorted_azimuths: &[f64]) -> f64 {
    let mut largest: f64 = 0.0;
    for w in sorted_azimuths.windows(2) {
        largest = largest.max(w[1] - w[0]);
    }
    let wrap = 360.0 - (sorted_azimuths[sorted_azimuths.len() - 1] - sorted_azimuths[0]);
    largest.max(wrap)
}

/// Principal axes of the covariance, scaled to 90 % confidence.
fn error_ellipse(
    covariance: &Matrix3<f64>,
    degrees_of_freedom: usize,
    comp: f64,
    cfg: &LocatorConfig,
) -> Option<ErrorEllipse> {
    let mut ellipse = ErrorEllipse::default();

    if degrees_of_freedom < 3 {
        // Depth held: two-axis horizontal ellipse from the lat/lon block.
        let block = Matrix2::new(
            covariance[(0, 0)],
            covariance[(0, 1)],
            covariance[(1, 0)],
            covariance[(1, 1)],
        );
        let eigen = SymmetricEigen::new(block);
        let scale = cfg.closeout.perpt_2d / comp;
        for k in 0..2 {
            let value = eigen.eigenvalues[k];
            if !value.is_finite() {
                return None;
            }
            let v = eigen.eigenvectors.column(k);
            let mut azimuth = v[1].atan2(v[0]).to_degrees();
            if azimuth < 0.0 {
                azimuth += 360.0;
            }
            ellipse.axes[k] = EllipseAxis {
                semi_len: scale * value.max(0.0).sqrt(),
                azimuth,
                plunge: 0.0,
            };
        }
    } else {
        let eigen = SymmetricEigen::new(*covariance);
        let scale = cfg.closeout.perpt_3d / comp;
        for k in 0..3 {
            let value = eigen.eigenvalues[k];
            if !value.is_finite() {
                return None;
            }
            let mut v = [
                eigen.eigenvectors[(0, k)],
                eigen.eigenvectors[(1, k)],
                eigen.eigenvectors[(2, k)],
            ];
            // The vertical component's sign disambiguates the axis
            // direction; flip so the plunge is non-negative.
            if v[2] < 0.0 {
                for c in &mut v {
                    *c = -*c;
                }
            }
            let horizontal = (v[0] * v[0] + v[1] * v[1]).sqrt();
            let mut azimuth = v[1].atan2(v[0]).to_degrees();
            if azimuth < 0.0 {
                azimuth += 360.0;
            }
            let plunge = v[2].atan2(horizontal).to_degrees();
            ellipse.axes[k] = EllipseAxis {
                semi_len: scale * value.max(0.0).sqrt(),
                azimuth,
                plunge,
            };
        }
    }

    ellipse
        .axes
        .sort_by(|a, b| b.semi_len.total_cmp(&a.semi_len));

    for axis in &ellipse.axes {
        let plunge_rad = axis.plunge.to_radians();
        ellipse.max_horizontal = ellipse
            .max_horizontal
            .max(axis.semi_len * plunge_rad.cos());
        ellipse.max_vertical = ellipse
            .max_vertical
            .max(axis.semi_len * plunge_rad.sin().abs());
    }
    ellipse.equivalent_radius = (ellipse.axes[0].semi_len * ellipse.axes[1].semi_len)
        .max(0.0)
        .sqrt();
    Some(ellipse)
}

/// A/B/C/D ladder with an aspect-ratio demotion; held or well-recorded
/// local events earn the ground-truth grade.
fn quality_grade(event: &Event, summary: &CloseoutSummary, cfg: &LocatorConfig) -> char {
    let c = &cfg.closeout;

    // Ground truth: an analyst-held hypocenter, or the GT5 criterion.
    if event.is_location_held || satisfies_gt5(event, summary, cfg) {
        return 'G';
    }

    let n_used = event.picks_used();
    let r_eq = summary.ellipse.equivalent_radius;
    let semi_max = summary.ellipse.axes[0].semi_len;
    // Two-axis ellipses carry a zero third axis; the aspect ratio only
    // considers the real axes.
    let semi_min = summary
        .ellipse
        .axes
        .iter()
        .map(|a| a.semi_len)
        .filter(|&s| s > 1.0e-9)
        .fold(semi_max, f64::min)
        .max(1.0e-6);

    let mut grade = if r_eq <= c.horiz_limits_km[0]
        && summary.depth_error <= c.vert_limits_km[0]
        && n_used > c.n_limits[0]
        && semi_max <= c.semi_limits_km[0]
    {
        'A'
    } else if r_eq <= c.horiz_limits_km[1]
        && summary.depth_error <= c.vert_limits_km[1]
        && n_used > c.n_limits[1]
        && semi_max <= c.semi_limits_km[1]
    {
        'B'
    } else if r_eq <= c.horiz_limits_km[2]
        && summary.depth_error <= c.vert_limits_km[2]
        && semi_max <= c.semi_limits_km[2]
    {
        'C'
    } else {
        'D'
    };

    // A needle-shaped ellipse is not trustworthy at its nominal grade.
    if semi_max / semi_min > c.aspect_demote_ratio {
        grade = match grade {
            'A' => 'B',
            'B' => 'C',
            _ => 'D',
        };
    }
    grade
}

/// GT5: dense local coverage with small gaps.
fn satisfies_gt5(event: &Event, summary: &CloseoutSummary, cfg: &LocatorConfig) -> bool {
    let c = &cfg.closeout;
    let local_picks = event
        .groups
        .iter()
        .filter(|g| g.distance_deg <= c.gt5_local_distance_deg)
        .map(|g| {
            g.picks
                .iter()
                .filter(|&&p| event.picks[p].is_used)
                .count()
        })
        .sum::<usize>();
    let min_distance_km = event.minimum_distance() * KM_PER_DEG;
    local_picks >= c.gt5_local_picks
        && min_distance_km <= c.gt5_min_distance_km
        && summary.azimuthal_gap <= c.gt5_gap_deg
        && summary.robust_gap <= c.gt5_secondary_gap_deg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AuthorType, Event, Hypocenter, Pick, Station, StationId};

    fn event_with_azimuths(azimuths: &[f64]) -> Event {
        let mut event = Event::new(Hypocenter::new(0.0, 0.0, 0.0, 10.0));
        for (i, &az) in azimuths.iter().enumerate() {
            // Place stations on a 5-degree ring at the requested azimuths.
            let lat = 5.0 * az.to_radians().cos();
            let lon = 5.0 * az.to_radians().sin();
            let s = event.add_station(Station {
                id: StationId {
                    network: "XX".to_string(),
                    station: format!("S{i:02}"),
                    location: "00".to_string(),
                },
                latitude: lat,
                longitude: lon,
                elevation: 0.0,
            });
            event.add_pick(Pick {
                external_id: format!("p{i}"),
                station: s,
                channel: "BHZ".to_string(),
                arrival_time: 60.0,
                quality: 0.5,
                external_use: true,
                affinity: 1.0,
                author_type: AuthorType::LocalHuman,
                original_phase: "P".to_string(),
                current_phase: "P".to_string(),
                best_phase: "P".to_string(),
                residual: 0.0,
                weight: 1.0,
                importance: 0.0,
                is_used: true,
                is_automatic: false,
                is_surface_wave: false,
                is_triage: false,
                travel_time: 60.0,
                scratch: Default::default(),
            });
        }
        event.build_groups();
        event
    }

    #[test]
    fn test_gap_bounds() {
        let event = event_with_azimuths(&[0.0, 90.0, 180.0, 270.0]);
        let (gap, robust) = azimuthal_gaps(&event);
        assert!((gap - 90.0).abs() < 1.0);
        assert!(robust >= gap);
        assert!(robust <= 360.0);
        // Removing any of four evenly spaced stations doubles the gap.
        assert!((robust - 180.0).abs() < 2.0);
    }

    #[test]
    fn test_gap_degenerate_cases() {
        let event = event_with_azimuths(&[45.0]);
        let (gap, robust) = azimuthal_gaps(&event);
        assert!((gap - 360.0).abs() < f64::EPSILON);
        assert!((robust - 360.0).abs() < f64::EPSILON);

        let event = event_with_azimuths(&[]);
        let (gap, robust) = azimuthal_gaps(&event);
        assert!((gap - 360.0).abs() < f64::EPSILON);
        assert!((robust - 360.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_ellipse_from_diagonal_covariance() {
        let cfg = LocatorConfig::default();
        let cov = Matrix3::new(4.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 9.0);
        let ellipse = error_ellipse(&cov, 3, 1.0, &cfg).expect("ellipse");
        // Axes sorted descending: depth (3 km sigma), lat (2), lon (1).
        let scale = cfg.closeout.perpt_3d;
        assert!((ellipse.axes[0].semi_len - 3.0 * scale).abs() < 1.0e-9);
        assert!((ellipse.axes[1].semi_len - 2.0 * scale).abs() < 1.0e-9);
        assert!((ellipse.axes[2].semi_len - 1.0 * scale).abs() < 1.0e-9);
        // The largest axis is vertical.
        assert!((ellipse.axes[0].plunge - 90.0).abs() < 1.0e-6);
        assert!((ellipse.max_vertical - 3.0 * scale).abs() < 1.0e-6);
        // Equivalent radius from the two longest axes.
        assert!((ellipse.equivalent_radius - (6.0 * scale * scale).sqrt()).abs() < 1.0e-6);
    }

    #[test]
    fn test_two_axis_ellipse_when_depth_held() {
        let cfg = LocatorConfig::default();
        let cov = Matrix3::new(4.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 9.0);
        let ellipse = error_ellipse(&cov, 2, 1.0, &cfg).expect("ellipse");
        let scale = cfg.closeout.perpt_2d;
        assert!((ellipse.axes[0].semi_len - 2.0 * scale).abs() < 1.0e-9);
        assert!((ellipse.axes[1].semi_len - 1.0 * scale).abs() < 1.0e-9);
        assert!(ellipse.axes[2].semi_len.abs() < 1.0e-12);
        assert!(ellipse.axes[0].plunge.abs() < 1.0e-12);
    }

    #[test]
    fn test_held_event_is_ground_truth() {
        let cfg = LocatorConfig::default();
        let mut event = event_with_azimuths(&[0.0, 120.0, 240.0]);
        event.is_location_held = true;
        let summary = CloseoutSummary::default();
        assert_eq!(quality_grade(&event, &summary, &cfg), 'G');
    }

    #[test]
    fn test_quality_ladder() {
        let cfg = LocatorConfig::default();
        let event = event_with_azimuths(&[0.0, 45.0, 90.0, 135.0, 180.0, 225.0, 270.0, 315.0]);

        let tight = CloseoutSummary {
            depth_error: 5.0,
            ellipse: ErrorEllipse {
                axes: [
                    EllipseAxis {
                        semi_len: 6.0,
                        ..EllipseAxis::default()
                    },
                    EllipseAxis {
                        semi_len: 5.0,
                        ..EllipseAxis::default()
                    },
                    EllipseAxis {
                        semi_len: 4.0,
                        ..EllipseAxis::default()
                    },
                ],
                equivalent_radius: 5.5,
                ..ErrorEllipse::default()
            },
            ..CloseoutSummary::default()
        };
        assert_eq!(quality_grade(&event, &tight, &cfg), 'A');

        let loose = CloseoutSummary {
            depth_error: 70.0,
            ellipse: ErrorEllipse {
                axes: [
                    EllipseAxis {
                        semi_len: 200.0,
                        ..EllipseAxis::default()
                    },
                    EllipseAxis {
                        semi_len: 150.0,
                        ..EllipseAxis::default()
                    },
                    EllipseAxis {
                        semi_len: 120.0,
                        ..EllipseAxis::default()
                    },
                ],
                equivalent_radius: 55.0,
                ..ErrorEllipse::default()
            },
            ..CloseoutSummary::default()
        };
        assert_eq!(quality_grade(&event, &loose, &cfg), 'C');
    }

    #[test]
    fn test_aspect_demotion() {
        let cfg = LocatorConfig::default();
        let event = event_with_azimuths(&[0.0, 45.0, 90.0, 135.0, 180.0, 225.0, 270.0, 315.0]);
        let needle = CloseoutSummary {
            depth_error: 5.0,
            ellipse: ErrorEllipse {
                axes: [
                    EllipseAxis {
                        semi_len: 40.0,
                        ..EllipseAxis::default()
                    },
                    EllipseAxis {
                        semi_len: 5.0,
                        ..EllipseAxis::default()
                    },
                    EllipseAxis {
                        semi_len: 2.0,
                        ..EllipseAxis::default()
                    },
                ],
                equivalent_radius: 8.0,
                ..ErrorEllipse::default()
            },
            ..CloseoutSummary::default()
        };
        // Meets every A threshold but the 20:1 aspect demotes it to B.
        assert_eq!(quality_grade(&event, &needle, &cfg), 'B');
    }
}
