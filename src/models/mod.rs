pub mod incident;
pub mod site_alert;

pub use incident::{Incident, IncidentDetail, IncidentPatch, NewIncident, ReviewStatus, Site};
pub use site_alert::{AlertMessage, SiteAlert};
