//! The locator service facade.
//!
//! Turns a `LocRequest` into a `LocResult`: builds the event arena, runs
//! the initial phase pass, drives the stepper, closes out, and maps the
//! internal status onto the wire exit code. Independent events can be
//! located in parallel with `locate_all()`.

use rayon::prelude::*;
use tracing::{info, warn};

use crate::closeout;
use crate::config::LocatorConfig;
use crate::decorr::{DefaultSignPolicy, EigenSignPolicy};
use crate::envelope::{datetime_to_seconds, LocRequest, LocResult, SourceType};
use crate::event::{phase_is_surface_wave, AuthorType, Event, Hypocenter, Pick, Station, StationId};
use crate::geo::{self, KM_PER_DEG};
use crate::phase_id::initial::initial_pass;
use crate::providers::{
    AuxiliaryData, CorrelationModel, DistanceDecayCorrelation, ProviderError, SessionContext,
    TravelTimeModel,
};
use crate::status::ExitCode;
use crate::stepper::Stepper;

/// The locator engine bound to its providers and configuration.
pub struct Locator<'a> {
    tt: &'a dyn TravelTimeModel,
    aux: &'a dyn AuxiliaryData,
    correlation: Box<dyn CorrelationModel>,
    sign_policy: Box<dyn EigenSignPolicy>,
    config: LocatorConfig,
}

impl<'a> Locator<'a> {
    /// Bind the engine to its external collaborators. The default
    /// correlation kernel and eigenvector sign policy can be replaced with
    /// the builder methods.
    pub fn new(
        tt: &'a dyn TravelTimeModel,
        aux: &'a dyn AuxiliaryData,
        config: LocatorConfig,
    ) -> Self {
        let config = config.sanitized();
        let correlation = Box::new(DistanceDecayCorrelation::new(
            config.decorrelation.correlation_length_deg,
        ));
        Self {
            tt,
            aux,
            correlation,
            sign_policy: Box::new(DefaultSignPolicy),
            config,
        }
    }

    /// Replace the inter-pick correlation model.
    #[must_use]
    pub fn with_correlation_model(mut self, model: Box<dyn CorrelationModel>) -> Self {
        self.correlation = model;
        self
    }

    /// Replace the eigenvector sign policy.
    #[must_use]
    pub fn with_sign_policy(mut self, policy: Box<dyn EigenSignPolicy>) -> Self {
        self.sign_policy = policy;
        self
    }

    pub fn config(&self) -> &LocatorConfig {
        &self.config
    }

    /// Locate one event.
    pub fn locate(&self, request: &LocRequest) -> LocResult {
        if let Err(e) = request.validate() {
            warn!(event = %request.id, error = %e, "rejecting request");
            return LocResult::failure(request, ExitCode::BadInput);
        }

        let mut event = self.build_event(request);
        let start = (
            event.hypocenter.latitude,
            event.hypocenter.longitude,
            event.hypocenter.depth,
        );

        // Pre-location heuristics need one session at the starting depth.
        if !event.is_location_held {
            let session = match self.tt.new_session(&SessionContext {
                earth_model: event.earth_model.clone(),
                source_depth: event.hypocenter.depth,
                source_latitude: event.hypocenter.latitude,
                source_longitude: event.hypocenter.longitude,
                all_phases: false,
                back_branches: false,
                is_tectonic: event.is_tectonic,
                use_regional: true,
            }) {
                Ok(s) => s,
                Err(e) => return LocResult::failure(request, map_provider_error(&e)),
            };
            initial_pass(&mut event, session.as_ref(), &self.config);
        }

        let stepper = Stepper::new(
            self.tt,
            self.aux,
            self.correlation.as_ref(),
            self.sign_policy.as_ref(),
            &self.config,
        );
        let status = match stepper.run(&mut event) {
            Ok(status) => status,
            Err(e) => {
                warn!(event = %request.id, error = %e, "provider failed during location");
                return LocResult::failure(request, map_provider_error(&e));
            }
        };

        let summary = closeout::close_out(&mut event, status, &self.config);
        let moved = self.moved_significantly(start, &event);
        let exit_code = ExitCode::from_status(summary.status, moved);
        info!(
            event = %request.id,
            status = %summary.status,
            exit = %exit_code,
            latitude = event.hypocenter.latitude,
            longitude = event.hypocenter.longitude,
            depth = event.hypocenter.depth,
            used = event.picks_used(),
            "location finished"
        );
        LocResult::from_event(request, &event, &summary, exit_code)
    }

    /// Locate a batch of independent events in parallel. Each event gets
    /// its own arena and stepper; the providers are shared read-only.
    pub fn locate_all(&self, requests: &[LocRequest]) -> Vec<LocResult> {
        requests.par_iter().map(|r| self.locate(r)).collect()
    }

    /// Assemble the event arena from the request.
    fn build_event(&self, request: &LocRequest) -> Event {
        let origin_seconds = datetime_to_seconds(request.source_origin_time);
        let mut event = Event::new(Hypocenter::new(
            origin_seconds,
            request.source_latitude,
            request.source_longitude,
            request.source_depth,
        ));
        event.earth_model = request.earth_model.clone();
        event.is_location_held = request.is_location_held;
        event.is_depth_held = request.is_depth_held || request.is_location_held;
        event.is_bayes_fixed = request.is_bayesian_depth;
        event.use_decorrelation = request.use_svd;
        event.is_location_new = request.is_location_new;
        event.is_location_restarted = !request.is_location_new;
        if request.is_bayesian_depth {
            event
                .hypocenter
                .set_bayes(request.bayesian_depth, request.bayesian_spread);
        } else {
            event.hypocenter.set_bayes(
                self.config.depth.default_depth_km,
                self.config.depth.default_depth_se_km,
            );
        }

        for input in &request.input_data {
            let station = event.add_station(Station {
                id: StationId {
                    network: input.site.network.clone(),
                    station: input.site.station.clone(),
                    location: input.site.location.clone(),
                },
                latitude: input.site.latitude,
                longitude: input.site.longitude,
                elevation: input.site.elevation,
            });

            let author_type = author_from_source(input.source.source_type);
            let is_automatic = author_type.is_automatic();
            let phase = input.starting_phase();
            let arrival_seconds = datetime_to_seconds(input.time);
            let usable = input.use_flag
                && arrival_seconds > origin_seconds - self.config.phase_id.max_neg_residual_s;

            event.add_pick(Pick {
                external_id: input.id.clone(),
                station,
                channel: input.site.channel.clone(),
                arrival_time: arrival_seconds,
                quality: input.quality,
                external_use: usable,
                affinity: Pick::resolve_affinity(input.affinity, author_type),
                author_type,
                original_phase: input.picked_phase.clone().unwrap_or_else(|| phase.clone()),
                current_phase: phase.clone(),
                best_phase: phase.clone(),
                residual: 0.0,
                weight: 0.0,
                importance: 0.0,
                is_used: usable,
                is_automatic,
                is_surface_wave: phase_is_surface_wave(&phase) && !is_automatic,
                is_triage: false,
                travel_time: arrival_seconds - origin_seconds,
                scratch: Default::default(),
            });
        }
        event.build_groups();
        event
    }

    /// Whether the solution moved more than the final-stage tolerance.
    fn moved_significantly(&self, start: (f64, f64, f64), event: &Event) -> bool {
        let (delta_deg, _) = geo::distance_azimuth(
            start.0,
            start.1,
            event.hypocenter.latitude,
            event.hypocenter.longitude,
        );
        let horizontal = delta_deg * KM_PER_DEG;
        let vertical = (event.hypocenter.depth - start.2).abs();
        let tolerance = self
            .config
            .stages
            .convergence_km
            .last()
            .copied()
            .unwrap_or(0.1);
        (horizontal * horizontal + vertical * vertical).sqrt() > tolerance
    }
}

fn author_from_source(source: SourceType) -> AuthorType {
    match source {
        SourceType::ContributedAutomatic => AuthorType::ContributedAutomatic,
        SourceType::LocalAutomatic => AuthorType::LocalAutomatic,
        SourceType::ContributedHuman => AuthorType::ContributedHuman,
        SourceType::LocalHuman => AuthorType::LocalHuman,
        SourceType::Unknown => AuthorType::Unknown,
    }
}

fn map_provider_error(error: &ProviderError) -> ExitCode {
    match error {
        ProviderError::TravelTime(_) => ExitCode::CouldNotReadTTData,
        ProviderError::Auxiliary(_) => ExitCode::CouldNotReadAuxData,
    }
}
