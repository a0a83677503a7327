// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of redgreen.
//
// redgreen is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// redgreen is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with redgreen.  If not,
// see <http://www.gnu.org/licenses/>.

//! # metrics
//!
//! redgreen uses [OpenTelemetry] for metrics. OTel advises re-using instruments rather than
//! re-creating them at each collection site, which raises the question of where to keep them;
//! I'd rather not grow a state-struct field per counter. Instead, collection sites register
//! their metric names with Tolnay's [inventory] crate:
//!
//! [OpenTelemetry]: https://docs.rs/opentelemetry/latest/opentelemetry/index.html
//!
//! ```ignore
//! inventory::submit! { metrics::Registration::new("uploads.accepted", Sort::IntegralCounter) }
//! // ...
//! counter_add!(state.instruments, "uploads.accepted", 1, &[]);
//! ```
//!
//! [Instruments::new] walks the registrations once, pre-building every instrument (and
//! panicking on name collisions or, later, on sort mismatches -- those are logic errors on par
//! with a bad `format!` string, not runtime conditions).

use std::collections::{hash_map::Entry, HashMap};

use opentelemetry::{
    global,
    metrics::{Counter, Gauge},
    KeyValue,
};

/// Instrument type
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Sort {
    /// Corresponds to `Counter<u64>`
    IntegralCounter,
    /// Corresponds to `Gauge<u64>`
    IntegralGauge,
}

/// The thing being inventoried: a metric name & its instrument sort
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Registration {
    name: &'static str,
    sort: Sort,
}

impl Registration {
    pub const fn new(name: &'static str, sort: Sort) -> Registration {
        Registration { name, sort }
    }
    pub fn name(&self) -> String {
        self.name.to_string()
    }
    pub fn sort(&self) -> Sort {
        self.sort
    }
}

inventory::collect!(Registration);

enum Instrument {
    CounterU64(Counter<u64>),
    GaugeU64(Gauge<u64>),
}

/// Container for every registered OTel instrument; build one & hang it off the app state
pub struct Instruments {
    map: HashMap<String, Instrument>,
}

impl Instruments {
    pub fn new(prefix: &'static str) -> Instruments {
        let meter = global::meter(prefix);
        let mut map: HashMap<String, Instrument> = HashMap::new();
        IntoIterator::into_iter(inventory::iter::<Registration>).for_each(|reg| {
            match map.entry(reg.name()) {
                Entry::Occupied(_) => panic!("the metric name {} was used twice", reg.name()),
                Entry::Vacant(vacant) => {
                    vacant.insert(match reg.sort() {
                        Sort::IntegralCounter => {
                            Instrument::CounterU64(meter.u64_counter(reg.name()).build())
                        }
                        Sort::IntegralGauge => {
                            Instrument::GaugeU64(meter.u64_gauge(reg.name()).build())
                        }
                    });
                }
            }
        });
        Instruments { map }
    }
    // panics if `name` doesn't name a counter
    pub fn add(&self, name: &str, count: u64, attributes: &[KeyValue]) {
        if let Some(Instrument::CounterU64(c)) = self.map.get(name) {
            c.add(count, attributes);
        } else {
            panic!("{} does not name a counter", name);
        }
    }
    // panics if `name` doesn't name a gauge
    pub fn recordu(&self, name: &str, value: u64, attributes: &[KeyValue]) {
        if let Some(Instrument::GaugeU64(g)) = self.map.get(name) {
            g.record(value, attributes);
        } else {
            panic!("{} does not name a gauge", name);
        }
    }
}

#[macro_export]
macro_rules! counter_add {
    ($instr:expr, $name:expr, $count:expr, $attrs:expr) => {
        $instr.add($name, $count, $attrs)
    };
}

#[macro_export]
macro_rules! gauge_setu {
    ($instr:expr, $name:expr, $value:expr, $attrs:expr) => {
        $instr.recordu($name, $value, $attrs)
    };
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn every_registration_builds() {
        let instruments = Instruments::new("redgreen");
        for reg in inventory::iter::<Registration> {
            match reg.sort() {
                Sort::IntegralCounter => counter_add!(instruments, &reg.name(), 0, &[]),
                Sort::IntegralGauge => gauge_setu!(instruments, &reg.name(), 0, &[]),
            }
        }
    }
}
