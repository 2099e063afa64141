//! The seasonal components of the model with their prediction errors

use std::collections::BTreeMap;

use decomposition_spi::{
    floor, DecompositionError, Result, SeasonalTime, StatePersistInserter,
    StateRestoreTraverser,
};
use tracing::debug;

use super::component_errors::{errors_from_delimited, errors_to_delimited, ComponentErrors};
use crate::change_detection::ChangePoint;
use crate::checksum::Checksum;
use crate::seasonal_component::SeasonalComponent;
use crate::seasonality_decomposition::SeasonalDecomposition;
use crate::stats::MinMax;

pub(super) const VERSION_TAG: &str = "6.4";
const COMPONENT_TAG: &str = "f";
const ERRORS_TAG: &str = "g";

/// Share of the longer component's bias moved into the shorter one per update
const DELTA_FRACTION: f64 = 0.1;

/// Key grouping components which apply at the same times; unwindowed
/// components share the `None` group.
type WindowKey = Option<(i64, i64, i64)>;

fn window_key(time: &SeasonalTime) -> WindowKey {
    time.is_windowed()
        .then(|| (time.window_repeat(), time.window_start(), time.window_end()))
}

/// Whether the windowed groups tile their repeat exactly, so every time is
/// in exactly one of them.
fn windows_partition(keys: &[(i64, i64, i64)]) -> bool {
    let Some(&(repeat, ..)) = keys.first() else {
        return false;
    };
    let mut windows: Vec<(i64, i64)> = keys
        .iter()
        .filter(|(r, ..)| *r == repeat)
        .map(|&(_, start, end)| (start, end))
        .collect();
    if windows.len() != keys.len() {
        return false;
    }
    windows.sort_unstable();
    let mut covered = 0;
    for (start, end) in windows {
        if start != covered {
            return false;
        }
        covered = end;
    }
    covered == repeat
}

/// Level and slope the trend must absorb after canonicalization
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CommonShift {
    pub level: f64,
    pub slope: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeasonalComponents {
    components: Vec<SeasonalComponent>,
    errors: Vec<ComponentErrors>,
}

impl SeasonalComponents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn components(&self) -> &[SeasonalComponent] {
        &self.components
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn set_decay_rate(&mut self, decay_rate: f64) {
        for component in &mut self.components {
            component.set_decay_rate(decay_rate);
        }
    }

    /// Total number of buckets
    pub fn size(&self) -> usize {
        self.components.iter().map(SeasonalComponent::size).sum()
    }

    /// Indices of the components whose window contains `time`.
    pub fn in_window(&self, time: i64) -> Vec<usize> {
        (0..self.components.len())
            .filter(|&i| self.components[i].time().in_window(time))
            .collect()
    }

    /// Damping terms for the components at `indices`, which must be in
    /// period order. Where a shorter period divides a longer one the longer
    /// component's consistent bias is moved into the shorter one.
    pub fn deltas(&self, time: i64, indices: &[usize]) -> Vec<f64> {
        let mut deltas = vec![0.0; indices.len()];
        for i in 1..indices.len() {
            let period = self.components[indices[i]].time().period();
            for j in (0..i).rev() {
                let short_period = self.components[indices[j]].time().period();
                if period % short_period == 0 {
                    let delta =
                        DELTA_FRACTION * self.components[indices[i]].delta(time, short_period);
                    deltas[j] += delta;
                    deltas[i] -= delta;
                    break;
                }
            }
        }
        deltas
    }

    pub fn component(&self, index: usize) -> &SeasonalComponent {
        &self.components[index]
    }

    pub fn component_and_errors_mut(
        &mut self,
        index: usize,
    ) -> (&mut SeasonalComponent, &mut ComponentErrors) {
        (&mut self.components[index], &mut self.errors[index])
    }

    /// Append the in window predictions less each component's mean.
    pub fn append_predictions(&self, time: i64, predictions: &mut Vec<f64>) {
        predictions.extend(
            self.components
                .iter()
                .filter(|component| component.time().in_window(time))
                .map(|component| component.value(time) - component.mean_value()),
        );
    }

    pub fn should_interpolate(&self, time: i64) -> bool {
        self.components
            .iter()
            .any(|component| component.should_interpolate(time))
    }

    pub fn interpolate(&mut self, time: i64, refine: bool) {
        for component in &mut self.components {
            if component.should_interpolate(time) {
                component.interpolate(time, refine);
            }
        }
    }

    pub fn add(&mut self, component: SeasonalComponent) {
        self.components.push(component);
        self.errors.push(ComponentErrors::new());
    }

    /// Restore period order after adding components.
    pub fn sort(&mut self) {
        let mut paired: Vec<(SeasonalComponent, ComponentErrors)> = self
            .components
            .drain(..)
            .zip(self.errors.drain(..))
            .collect();
        paired.sort_by_key(|(component, _)| {
            let time = component.time();
            (
                time.period(),
                time.window_repeat(),
                time.window_start(),
                time.window_end(),
            )
        });
        let (components, errors): (Vec<_>, Vec<_>) = paired.into_iter().unzip();
        self.components = components;
        self.errors = errors;
    }

    pub fn clear_errors(&mut self) {
        for errors in &mut self.errors {
            errors.clear();
        }
    }

    /// Remove the components flagged in `mask`. False if the mask doesn't
    /// match the components.
    pub fn remove(&mut self, mask: &[bool]) -> bool {
        if mask.len() != self.components.len() {
            return false;
        }
        let mut keep = mask.iter().map(|remove| !remove);
        let mut keep_errors = keep.clone();
        self.components.retain(|_| keep.next().unwrap_or(true));
        self.errors.retain(|_| keep_errors.next().unwrap_or(true));
        true
    }

    /// Memory change of applying `decomposition`.
    pub fn estimate_size_change(&self, decomposition: &SeasonalDecomposition) -> isize {
        let removed: usize = decomposition
            .remove()
            .iter()
            .zip(&self.components)
            .filter(|(remove, _)| **remove)
            .map(|(_, component)| component.memory_usage())
            .sum();
        let added: usize = decomposition
            .components()
            .iter()
            .map(|component| component.memory_usage())
            .sum();
        added as isize - removed as isize
    }

    /// Remove components containing non-finite values, true if any were.
    pub fn remove_bad(&mut self, time: i64) -> bool {
        let mask: Vec<bool> = self
            .components
            .iter()
            .map(|component| {
                let bad = component.is_bad();
                if bad {
                    debug!(
                        time,
                        period = component.time().period(),
                        "Removing seasonal component with invalid values"
                    );
                }
                bad
            })
            .collect();
        let any = mask.iter().any(|bad| *bad);
        if any {
            self.remove(&mask);
        }
        any
    }

    /// Remove components which no longer reduce the prediction error. The
    /// level of a removed component moves into another component which
    /// applies at the same times if there is one; whatever is left over is
    /// returned for the trend.
    pub fn prune(&mut self, time: i64, bucket_length: i64) -> f64 {
        if self.components.len() < 2 {
            return 0.0;
        }
        let mut windowed: BTreeMap<WindowKey, usize> = BTreeMap::new();
        for component in &self.components {
            if let key @ Some(_) = window_key(component.time()) {
                *windowed.entry(key).or_default() += 1;
            }
        }

        let mut mask = vec![false; self.components.len()];
        let mut shifts: BTreeMap<WindowKey, f64> = BTreeMap::new();
        for (i, (component, errors)) in self.components.iter().zip(&self.errors).enumerate() {
            let key = window_key(component.time());
            let count = windowed.get(&key).copied();
            if count.map_or(true, |count| count > 1)
                && errors.remove(bucket_length, component.time().period())
            {
                debug!(
                    time,
                    component = %component.time().describe(),
                    "Removing seasonal component"
                );
                mask[i] = true;
                *shifts.entry(key).or_default() += component.mean_value();
                if let Some(count) = windowed.get_mut(&key) {
                    *count -= 1;
                }
            }
        }
        if !mask.iter().any(|remove| *remove) {
            return 0.0;
        }
        self.remove(&mask);

        let mut trend_shift = 0.0;
        for (key, shift) in shifts {
            let target = self
                .components
                .iter()
                .position(|component| key.is_some() && window_key(component.time()) == key)
                .or_else(|| {
                    self.components
                        .iter()
                        .position(|component| !component.time().is_windowed())
                });
            match target {
                Some(index) => self.components[index].shift_level(shift),
                None => trend_shift += shift,
            }
        }
        trend_shift
    }

    /// Move the common level, and the common slope if `slopes` is set, of
    /// the components into the trend, returning what the trend must absorb.
    ///
    /// Unwindowed components apply at all times so their summed level moves
    /// wholesale. Windowed groups only move the margin common to all of
    /// them and only when they tile their repeat.
    pub fn canonicalize(&mut self, time: i64, slopes: bool) -> CommonShift {
        let mut levels: BTreeMap<WindowKey, (f64, f64)> = BTreeMap::new();
        let mut slope_sums: BTreeMap<WindowKey, (f64, f64)> = BTreeMap::new();
        for component in &self.components {
            let key = window_key(component.time());
            let level = levels.entry(key).or_default();
            level.0 += component.mean_value();
            level.1 += 1.0;
            if slopes && component.slope_accurate(time) {
                let slope = slope_sums.entry(key).or_default();
                slope.0 += component.slope();
                slope.1 += 1.0;
            }
        }

        let margins = |sums: &BTreeMap<WindowKey, (f64, f64)>| -> BTreeMap<WindowKey, f64> {
            let mut result = BTreeMap::new();
            if let Some(&(sum, _)) = sums.get(&None) {
                result.insert(None, sum);
            }
            let keys: Vec<(i64, i64, i64)> = sums.keys().filter_map(|key| *key).collect();
            if windows_partition(&keys) {
                let mut common = MinMax::default();
                for key in &keys {
                    common.add(sums[&Some(*key)].0);
                }
                let margin = common.sign_margin();
                for key in keys {
                    result.insert(Some(key), margin);
                }
            }
            result
        };

        let mut shift = CommonShift::default();
        let level_margins = margins(&levels);
        for component in &mut self.components {
            let key = window_key(component.time());
            if let (Some(&margin), Some(&(sum, count))) = (level_margins.get(&key), levels.get(&key)) {
                if margin != 0.0 {
                    component.shift_level((sum - margin) / count - component.mean_value());
                }
            }
        }
        shift.level = level_margins.get(&None).copied().unwrap_or(0.0)
            + level_margins
                .iter()
                .find_map(|(key, margin)| key.map(|_| *margin))
                .unwrap_or(0.0);

        let slope_margins = margins(&slope_sums);
        for component in &mut self.components {
            if !(slopes && component.slope_accurate(time)) {
                continue;
            }
            let key = window_key(component.time());
            if let (Some(&margin), Some(&(sum, count))) =
                (slope_margins.get(&key), slope_sums.get(&key))
            {
                if margin != 0.0 {
                    let slope = component.slope();
                    component.shift_slope(time, (sum - margin) / count - slope);
                }
            }
        }
        shift.slope = slope_margins.get(&None).copied().unwrap_or(0.0)
            + slope_margins
                .iter()
                .find_map(|(key, margin)| key.map(|_| *margin))
                .unwrap_or(0.0);
        shift
    }

    pub fn apply(&mut self, change: &ChangePoint) {
        for (component, errors) in self.components.iter_mut().zip(&mut self.errors) {
            if change.apply_to_seasonal(component) {
                errors.clear();
            }
        }
    }

    /// Age each component once per whole period elapsed.
    pub fn propagate_forwards(&mut self, start: i64, end: i64) {
        for (component, errors) in self.components.iter_mut().zip(&mut self.errors) {
            let period = component.time().period();
            let (start, end) = (floor(start, period), floor(end, period));
            if end > start {
                let periods = (end - start) as f64 / period as f64;
                component.propagate_forwards_by_time(periods / 6.0);
                errors.age((-component.decay_rate() * periods).exp());
            }
        }
    }

    pub fn shift_origin(&mut self, time: i64) {
        for component in &mut self.components {
            component.shift_origin(time);
        }
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
            + self
                .components
                .iter()
                .map(SeasonalComponent::memory_usage)
                .sum::<usize>()
            + self.errors.capacity() * std::mem::size_of::<ComponentErrors>()
    }

    pub fn accept_persist_inserter(&self, inserter: &mut dyn StatePersistInserter) {
        inserter.insert_value(VERSION_TAG, "");
        for component in &self.components {
            inserter.insert_level(COMPONENT_TAG, &mut |inserter| {
                component.accept_persist_inserter(inserter)
            });
        }
        inserter.insert_value(ERRORS_TAG, &errors_to_delimited(&self.errors));
    }

    pub fn restore(decay_rate: f64, traverser: &mut dyn StateRestoreTraverser) -> Result<Self> {
        if traverser.name() != VERSION_TAG {
            return Err(DecompositionError::unsupported_version(
                traverser.name(),
                VERSION_TAG,
            ));
        }
        let mut result = Self::new();
        while traverser.next() {
            match traverser.name() {
                COMPONENT_TAG => {
                    let mut component = None;
                    traverser.traverse_sub_level(&mut |traverser| {
                        component = Some(SeasonalComponent::restore(decay_rate, traverser)?);
                        Ok(())
                    })?;
                    result.components.extend(component);
                }
                ERRORS_TAG => result.errors = errors_from_delimited(traverser.value())?,
                "" => {}
                other => return Err(DecompositionError::parse(other, traverser.value())),
            }
        }
        if result.errors.len() != result.components.len() {
            return Err(DecompositionError::MissingValue(ERRORS_TAG.to_string()));
        }
        Ok(result)
    }
}

impl Checksum for SeasonalComponents {
    fn checksum(&self, seed: u64) -> u64 {
        let seed = self.components.checksum(seed);
        self.errors.checksum(seed)
    }
}
