//! Labels attached to everything the load test creates.
use std::collections::BTreeMap;

/// Key of the label marking objects created by the load test.
pub const TRACKING_LABEL_KEY: &str = "load-test";
/// Value of the tracking label.
pub const TRACKING_LABEL_VALUE: &str = "test-type";
/// Selector matching every object carrying the tracking label.
pub const TRACKING_LABEL_SELECTOR: &str = "load-test=test-type";

/// Label written by the admission webhook with the identity of the creator.
/// Users must not be able to overwrite it.
pub const CREATOR_LABEL_KEY: &str = "controller.devfile.io/creator";

/// The tracking label pair as a label map.
pub fn tracking_labels() -> BTreeMap<String, String> {
    BTreeMap::from_iter([(
        TRACKING_LABEL_KEY.to_owned(),
        TRACKING_LABEL_VALUE.to_owned(),
    )])
}
