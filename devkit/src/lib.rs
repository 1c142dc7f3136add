/*!
# ChaosMonkey DevKit - Doublures et harness de test

Bibliothèque facilitant les tests du noyau sans hyperviseur ni Prometheus:
- `MockPlatform`: adaptateur scripté (pannes de connexion, cibles en échec, latence)
- `StubMetricSource`: source de métriques scriptée
- `UnreachableStore`: backend de cache toujours en panne
- `TestHarness`: assemble registre, échantillonneur et séquenceur
*/

pub mod cache_stub;
pub mod metrics_stub;
pub mod platform_stub;
pub mod test_utils;

pub use cache_stub::UnreachableStore;
pub use metrics_stub::StubMetricSource;
pub use platform_stub::{MockPlatform, PowerCall};
pub use test_utils::TestHarness;
