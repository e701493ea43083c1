use crate::identity::{DeviceId, DongleId};

/// Project name used when `project_name` is not configured.
pub const DEFAULT_PROJECT: &str = "DEFAULT";

/// Option key for the topic root.
pub const PROJECT_NAME_KEY: &str = "project_name";

/// Builder for the broker topics owned by one dongle.
///
/// Topics follow the pattern:
/// - `<project>/data/<dongle>/<device>` for readings
/// - `<project>/device/<dongle>/<device>` for device registration
/// - `<project>/status/<dongle>` for dongle status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    project: String,
    dongle_id: DongleId,
}

impl TopicBuilder {
    pub fn new(project: impl Into<String>, dongle_id: DongleId) -> Self {
        Self {
            project: project.into(),
            dongle_id,
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn dongle_id(&self) -> &DongleId {
        &self.dongle_id
    }

    /// Topic carrying readings from a device.
    ///
    /// # Example
    /// ```
    /// use dongle_common::{DeviceId, DongleId, TopicBuilder};
    ///
    /// let topics = TopicBuilder::new("icu", DongleId::new("d1").unwrap());
    /// let device = DeviceId::new("rad8").unwrap();
    /// assert_eq!(topics.data(&device), "icu/data/d1/rad8");
    /// ```
    pub fn data(&self, device_id: &DeviceId) -> String {
        format!("{}/data/{}/{}", self.project, self.dongle_id, device_id)
    }

    /// Topic carrying the retained descriptor of a registered device.
    pub fn device(&self, device_id: &DeviceId) -> String {
        format!("{}/device/{}/{}", self.project, self.dongle_id, device_id)
    }

    /// Topic carrying the retained dongle status.
    pub fn status(&self) -> String {
        format!("{}/status/{}", self.project, self.dongle_id)
    }
}
