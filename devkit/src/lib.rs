/*!
# WristLink DevKit - Stubs et Utilitaires pour Développement

Bibliothèque facilitant le développement de l'agent WristLink avec:
- Stub HTTP du backend de télémétrie (sans serveur réel)
- Fausse montre TCP parlant le protocole ligne
- Helpers pour construire les messages du protocole
*/

pub mod backend_stub;
pub mod fake_watch;
pub mod lines;

pub use backend_stub::StubBackend;
pub use fake_watch::{FakeWatch, WatchScript};
pub use lines::WireBuilder;
