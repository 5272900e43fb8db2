use crate::units::Coordinates;
use crate::weather::WeatherProvider;
use std::sync::Arc;

pub type SharedProvider = Arc<dyn WeatherProvider + Send + Sync>;

/// Primary and fallback choice for one coordinate.
#[derive(Debug, Clone)]
pub struct Selection {
    pub primary: SharedProvider,
    pub fallback: Option<SharedProvider>,
}

/// Pure scan over the registered providers in their fixed priority
/// order: the first whose coverage contains the coordinate is primary,
/// the next is fallback. `None` when nothing covers the point.
pub fn select(providers: &[SharedProvider], coordinates: &Coordinates) -> Option<Selection> {
    let mut covering = providers
        .iter()
        .filter(|p| p.manifest().coverage.contains(coordinates));

    let primary = covering.next()?;

    Some(Selection {
        primary: Arc::clone(primary),
        fallback: covering.next().map(Arc::clone),
    })
}

pub fn by_id(providers: &[SharedProvider], id: &str) -> Option<SharedProvider> {
    providers.iter().find(|p| p.id() == id).map(Arc::clone)
}
