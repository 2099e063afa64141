//! Synchronous publish/subscribe between the decomposition's handlers

use std::cell::RefCell;
use std::rc::Rc;

use tracing::trace;

use crate::message::{
    AddValue, DetectedCalendar, DetectedChangePoint, DetectedSeasonal, DetectedTrend, Message,
};

/// Something which reacts to messages. Every case defaults to a no-op.
///
/// The mediator doing the dispatch is passed in so a handler can forward
/// derived messages; it is never stored.
pub trait Handler {
    fn handle_add_value(&mut self, _message: &AddValue<'_>, _mediator: &Mediator) {}

    fn handle_detected_seasonal(&mut self, _message: &DetectedSeasonal<'_>, _mediator: &Mediator) {}

    fn handle_detected_calendar(&mut self, _message: &DetectedCalendar<'_>, _mediator: &Mediator) {}

    fn handle_detected_trend(&mut self, _message: &DetectedTrend<'_>, _mediator: &Mediator) {}

    fn handle_detected_change_point(
        &mut self,
        _message: &DetectedChangePoint<'_>,
        _mediator: &Mediator,
    ) {
    }

    fn handle(&mut self, message: &Message<'_>, mediator: &Mediator) {
        match message {
            Message::AddValue(message) => self.handle_add_value(message, mediator),
            Message::DetectedSeasonal(message) => self.handle_detected_seasonal(message, mediator),
            Message::DetectedCalendar(message) => self.handle_detected_calendar(message, mediator),
            Message::DetectedTrend(message) => self.handle_detected_trend(message, mediator),
            Message::DetectedChangePoint(message) => {
                self.handle_detected_change_point(message, mediator)
            }
        }
    }
}

pub type HandlerRef = Rc<RefCell<dyn Handler>>;

/// Ordered list of handlers
#[derive(Default)]
pub struct Mediator {
    handlers: Vec<HandlerRef>,
}

impl Mediator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler(&mut self, handler: HandlerRef) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Dispatch `message` to every handler in registration order. Nested
    /// forwards run depth first. A handler which is itself mid-dispatch
    /// doesn't see the messages it forwards.
    pub fn forward(&self, message: &Message<'_>) {
        for (index, handler) in self.handlers.iter().enumerate() {
            match handler.try_borrow_mut() {
                Ok(mut handler) => handler.handle(message, self),
                Err(_) => trace!(message = message.name(), index, "Skipping busy handler"),
            }
        }
    }
}

impl std::fmt::Debug for Mediator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mediator")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageHeader;
    use decomposition_spi::{AlwaysAllowAllocations, CalendarFeature};

    /// Mock implementation: records what it saw
    struct Recorder {
        name: &'static str,
        log: Rc<RefCell<Vec<String>>>,
        forward_trend_on_calendar: bool,
    }

    impl Handler for Recorder {
        fn handle_detected_calendar(&mut self, message: &DetectedCalendar<'_>, mediator: &Mediator) {
            self.log.borrow_mut().push(format!("{}:calendar", self.name));
            if self.forward_trend_on_calendar {
                let callback = |_: Vec<crate::stats::MeanAccumulator>| {};
                mediator.forward(&Message::DetectedTrend(DetectedTrend {
                    header: message.header,
                    predictor: Default::default(),
                    component_change: &callback,
                }));
            }
        }

        fn handle_detected_trend(&mut self, _message: &DetectedTrend<'_>, _mediator: &Mediator) {
            self.log.borrow_mut().push(format!("{}:trend", self.name));
        }
    }

    fn recorder(
        name: &'static str,
        log: &Rc<RefCell<Vec<String>>>,
        forward_trend_on_calendar: bool,
    ) -> HandlerRef {
        Rc::new(RefCell::new(Recorder {
            name,
            log: Rc::clone(log),
            forward_trend_on_calendar,
        }))
    }

    fn calendar_message(breaker: &AlwaysAllowAllocations) -> Message<'_> {
        Message::DetectedCalendar(DetectedCalendar {
            header: MessageHeader::new(10, 0, breaker),
            feature: CalendarFeature::DayOfMonth(0),
            time_zone_offset: 0,
        })
    }

    #[test]
    fn test_forward_in_registration_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut mediator = Mediator::new();
        mediator.register_handler(recorder("a", &log, false));
        mediator.register_handler(recorder("b", &log, false));
        assert_eq!(mediator.len(), 2);
        let breaker = AlwaysAllowAllocations;
        mediator.forward(&calendar_message(&breaker));
        assert_eq!(*log.borrow(), vec!["a:calendar", "b:calendar"]);
    }

    #[test]
    fn test_nested_forward_is_depth_first_and_skips_sender() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut mediator = Mediator::new();
        mediator.register_handler(recorder("a", &log, true));
        mediator.register_handler(recorder("b", &log, false));
        let breaker = AlwaysAllowAllocations;
        mediator.forward(&calendar_message(&breaker));
        assert_eq!(*log.borrow(), vec!["a:calendar", "b:trend", "b:calendar"]);
    }

    #[test]
    fn test_default_handlers_ignore_messages() {
        struct Quiet;
        impl Handler for Quiet {}
        let mut mediator = Mediator::new();
        mediator.register_handler(Rc::new(RefCell::new(Quiet)));
        let breaker = AlwaysAllowAllocations;
        let message = calendar_message(&breaker);
        mediator.forward(&message);
        assert_eq!(message.name(), "detected_calendar");
        assert_eq!(message.time(), 10);
    }
}
