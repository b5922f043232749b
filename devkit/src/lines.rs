/*!
Helpers pour construire les messages du protocole WristLink

Côté montre: lignes texte `Clé:Valeur` séparées par des virgules.
Côté backend: corps JSON des réponses haptiques et de configuration.
*/

use serde_json::Value;

/// Constructeur de messages conformes au protocole de la montre.
pub struct WireBuilder;

impl WireBuilder {
    /// Ligne de mesure cardiaque avec identité complète.
    pub fn heart_rate_line(value: u32, android_id: &str, user_id: &str, watch_id: &str) -> String {
        format!(
            "MonitoringType:HeartRate,AndroidID:{android_id},UserID:{user_id},SmartWatchID:{watch_id},Value:{value}"
        )
    }

    /// Ligne de mesure dont l'identité est entièrement inconnue; l'agent
    /// doit la récupérer via ses indices système.
    pub fn unknown_identity_line(value: u32) -> String {
        format!(
            "MonitoringType:HeartRate,AndroidID:UnknownAndroid,UserID:UnknownUser,SmartWatchID:UnknownWatch,Value:{value}"
        )
    }

    /// Corps JSON d'une commande haptique renvoyée par le backend.
    pub fn haptic_response(pulses: u32, intensity: u32, duration: u32, interval: u32) -> Value {
        serde_json::json!({
            "pulses": pulses,
            "intensity": intensity,
            "duration": duration,
            "interval": interval
        })
    }

    /// Corps JSON de /get-monitoring-config.
    pub fn mode_config(mode: &str) -> Value {
        serde_json::json!({ "monitoringType": mode })
    }
}
