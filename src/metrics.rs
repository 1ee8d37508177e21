// This file is part of babe-producer.

// Copyright (C) 2021-2022 the babe-producer authors.
// SPDX-License-Identifier: GPL-3.0-or-later WITH Classpath-exception-2.0

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Block production Prometheus metrics.

use std::sync::Arc;

use prometheus_endpoint::{
	register, Counter, Histogram, HistogramOpts, PrometheusError, Registry, U64,
};

/// Shareable, optional handle to the producer metrics.
#[derive(Clone, Default)]
pub(crate) struct MetricsLink(Arc<Option<Metrics>>);

impl MetricsLink {
	pub fn new(registry: Option<&Registry>) -> Self {
		Self(Arc::new(registry.and_then(|registry| {
			Metrics::register(registry)
				.map_err(|err| {
					log::warn!(target: "babe", "Failed to register prometheus metrics: {}", err);
				})
				.ok()
		})))
	}

	pub fn report(&self, do_this: impl FnOnce(&Metrics)) {
		if let Some(metrics) = self.0.as_ref() {
			do_this(metrics);
		}
	}
}

/// Block production metrics.
pub(crate) struct Metrics {
	pub block_constructed: Histogram,
	pub block_construction_errors: Counter<U64>,
}

impl Metrics {
	fn register(registry: &Registry) -> Result<Self, PrometheusError> {
		Ok(Self {
			block_constructed: register(
				Histogram::with_opts(HistogramOpts::new(
					"babe_block_constructed",
					"Histogram of time taken to construct a new block",
				))?,
				registry,
			)?,
			block_construction_errors: register(
				Counter::new(
					"babe_block_construction_errors_total",
					"Total number of slots where block construction failed",
				)?,
				registry,
			)?,
		})
	}
}
