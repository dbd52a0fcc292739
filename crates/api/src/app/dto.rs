use serde::Deserialize;

/// `?max=N` on the trigger endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct RunQuery {
    pub max: Option<usize>,
}
