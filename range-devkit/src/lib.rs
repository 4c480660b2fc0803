/*!
# Range DevKit - Mocks et Utilitaires de Test

Bibliothèque facilitant les tests du Range Manager sans infrastructure :
- Mock de la flotte compute (Proxmox)
- Mock du service d'accès (Guacamole)
- Mock du canal SSH
- Harness assemblant un orchestrateur complet
*/

pub mod access_stub;
pub mod compute_stub;
pub mod shell_stub;
pub mod test_utils;

pub use access_stub::MockAccessApi;
pub use compute_stub::{MockComputeApi, LOCKED_MESSAGE};
pub use shell_stub::{interface_listing, MockRemoteShell};
pub use test_utils::{snapshot, TestHarness};
