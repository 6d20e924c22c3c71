//! ---
//! mqb_section: "04-session-core"
//! mqb_subsection: "module"
//! mqb_type: "source"
//! mqb_scope: "code"
//! mqb_description: "Session, consumer, and producer delivery core."
//! mqb_version: "v0.1.0"
//! mqb_owner: "tbd"
//! ---
//! Plug-in point for message selectors.
//!
//! The bridge treats selector strings as opaque. A connection built without
//! an evaluator refuses consumers that carry one.
use crate::message::Message;
use crate::Result;

/// Decides whether a message matches a consumer's selector.
pub trait SelectorEvaluator: Send + Sync {
    /// Reject a selector at consumer creation. Accepts everything by default.
    fn validate(&self, _selector: &str) -> Result<()> {
        Ok(())
    }

    /// Whether `message` should be delivered to a consumer created with `selector`.
    fn matches(&self, message: &Message, selector: &str) -> Result<bool>;
}

impl<F> SelectorEvaluator for F
where
    F: Fn(&Message, &str) -> bool + Send + Sync,
{
    fn matches(&self, message: &Message, selector: &str) -> Result<bool> {
        Ok(self(message, selector))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PropertyValue;

    #[test]
    fn closures_act_as_evaluators() {
        let evaluator = |message: &Message, selector: &str| {
            message.property("region") == Some(&PropertyValue::String(selector.to_owned()))
        };
        let eu = Message::text("x").with_property("region", "eu");
        assert!(evaluator.matches(&eu, "eu").unwrap());
        assert!(!evaluator.matches(&eu, "us").unwrap());
        evaluator.validate("anything").unwrap();
    }
}
