//! The calendar components of the model with their prediction errors

use decomposition_spi::{
    floor, CalendarFeature, DecompositionError, Result, StatePersistInserter,
    StateRestoreTraverser, MONTH,
};
use tracing::debug;

use super::component_errors::{errors_from_delimited, errors_to_delimited, ComponentErrors};
use super::seasonal::VERSION_TAG;
use crate::calendar_component::CalendarComponent;
use crate::change_detection::ChangePoint;
use crate::checksum::Checksum;

const COMPONENT_TAG: &str = "f";
const ERRORS_TAG: &str = "g";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalendarComponents {
    components: Vec<CalendarComponent>,
    errors: Vec<ComponentErrors>,
}

impl CalendarComponents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn components(&self) -> &[CalendarComponent] {
        &self.components
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn set_decay_rate(&mut self, decay_rate: f64) {
        for component in &mut self.components {
            component.set_decay_rate(decay_rate);
        }
    }

    pub fn size(&self) -> usize {
        self.components.iter().map(CalendarComponent::size).sum()
    }

    pub fn have_component(&self, feature: CalendarFeature) -> bool {
        self.components
            .iter()
            .any(|component| component.feature() == feature)
    }

    pub fn add(&mut self, component: CalendarComponent) {
        self.components.push(component);
        self.errors.push(ComponentErrors::new());
    }

    pub fn in_window(&self, time: i64) -> Vec<usize> {
        (0..self.components.len())
            .filter(|&i| self.components[i].in_window(time))
            .collect()
    }

    pub fn component(&self, index: usize) -> &CalendarComponent {
        &self.components[index]
    }

    pub fn component_and_errors_mut(
        &mut self,
        index: usize,
    ) -> (&mut CalendarComponent, &mut ComponentErrors) {
        (&mut self.components[index], &mut self.errors[index])
    }

    pub fn append_predictions(&self, time: i64, predictions: &mut Vec<f64>) {
        predictions.extend(
            self.components
                .iter()
                .filter(|component| component.in_window(time))
                .map(|component| component.value(time) - component.mean_value()),
        );
    }

    pub fn should_interpolate(&self, time: i64) -> bool {
        self.components
            .iter()
            .any(|component| component.should_interpolate(time))
    }

    pub fn interpolate(&mut self, time: i64) {
        for component in &mut self.components {
            if component.should_interpolate(time) {
                component.interpolate(time);
            }
        }
    }

    pub fn clear_errors(&mut self) {
        for errors in &mut self.errors {
            errors.clear();
        }
    }

    fn remove(&mut self, mask: &[bool]) {
        let mut keep = mask.iter().map(|remove| !remove);
        let mut keep_errors = keep.clone();
        self.components.retain(|_| keep.next().unwrap_or(true));
        self.errors.retain(|_| keep_errors.next().unwrap_or(true));
    }

    pub fn remove_bad(&mut self, time: i64) -> bool {
        let mask: Vec<bool> = self.components.iter().map(CalendarComponent::is_bad).collect();
        let any = mask.iter().any(|bad| *bad);
        if any {
            debug!(time, "Removing calendar components with invalid values");
            self.remove(&mask);
        }
        any
    }

    /// Remove components which no longer reduce the prediction error.
    pub fn prune(&mut self, time: i64, bucket_length: i64) {
        let mask: Vec<bool> = self
            .components
            .iter()
            .zip(&self.errors)
            .map(|(component, errors)| {
                let remove = errors.remove(bucket_length, component.feature().window());
                if remove {
                    debug!(time, feature = %component.feature(), "Removing calendar component");
                }
                remove
            })
            .collect();
        if mask.iter().any(|remove| *remove) {
            self.remove(&mask);
        }
    }

    pub fn apply(&mut self, change: &ChangePoint) {
        for (component, errors) in self.components.iter_mut().zip(&mut self.errors) {
            if change.apply_to_calendar(component) {
                errors.clear();
            }
        }
    }

    /// Age once per whole month elapsed.
    pub fn propagate_forwards(&mut self, start: i64, end: i64) {
        let (start, end) = (floor(start, MONTH), floor(end, MONTH));
        if end <= start {
            return;
        }
        let months = (end - start) as f64 / MONTH as f64;
        for (component, errors) in self.components.iter_mut().zip(&mut self.errors) {
            component.propagate_forwards_by_time(months);
            errors.age((-component.decay_rate() * months).exp());
        }
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
            + self
                .components
                .iter()
                .map(CalendarComponent::memory_usage)
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
                        component = Some(CalendarComponent::restore(decay_rate, traverser)?);
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

impl Checksum for CalendarComponents {
    fn checksum(&self, seed: u64) -> u64 {
        let seed = self.components.checksum(seed);
        self.errors.checksum(seed)
    }
}
