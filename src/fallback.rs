//! 关键词回复
//!
//! 模型未加载或生成失败时使用。按固定顺序匹配关键词意图，
//! 第一个命中的意图决定回复；都不命中时返回默认回复。

use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// 默认回复的置信度
pub const DEFAULT_CONFIDENCE: f32 = 0.70;
/// 默认回复的意图名
pub const DEFAULT_INTENT: &str = "default";

/// 关键词意图
#[derive(Debug, Clone, Copy)]
pub struct Intent {
    pub name: &'static str,
    /// 规范化后的消息包含其中任意一个即命中
    pub keywords: &'static [&'static str],
    /// 候选回复，随机选一个
    pub replies: &'static [&'static str],
    pub confidence: f32,
}

impl Intent {
    fn matches(&self, normalized: &str) -> bool {
        self.keywords.iter().any(|k| normalized.contains(k))
    }
}

/// 匹配顺序即优先级
pub const INTENTS: &[Intent] = &[
    Intent {
        name: "greeting",
        keywords: &["hola", "buenos", "buenas", "hey", "saludos"],
        replies: &[
            "¡Hola! 👋 Soy tu asistente virtual con IA. ¿En qué puedo ayudarte?",
            "¡Bienvenido! Estoy aquí para ayudarte con información del Pet Store.",
            "¡Hola! Pregúntame sobre mascotas, citas, estadísticas o predicciones.",
        ],
        confidence: 0.95,
    },
    Intent {
        name: "farewell",
        keywords: &["adios", "chao", "hasta luego", "bye", "gracias"],
        replies: &[
            "¡Hasta pronto! 👋 Cuida bien a tus mascotas 🐾",
            "¡Adiós! Regresa cuando necesites ayuda.",
            "¡Nos vemos! Que tengas un excelente día.",
        ],
        confidence: 0.95,
    },
    Intent {
        name: "emergency",
        keywords: &["emergencia", "urgente", "grave", "ayuda"],
        replies: &["🚨 EMERGENCIA VETERINARIA\n\n\
            Lleva a tu mascota al veterinario INMEDIATAMENTE si presenta:\n\
            • Dificultad para respirar\n\
            • Sangrado que no para\n\
            • Convulsiones o pérdida de conciencia\n\
            • Abdomen hinchado y duro\n\
            • Intoxicación conocida\n\n\
            Mientras llegas: mantén la calma, transpórtala con cuidado, \
            no des medicamentos y llama antes de ir.\n\n\
            ⏱️ En emergencias, cada minuto cuenta."],
        confidence: 0.95,
    },
    Intent {
        name: "vaccines",
        keywords: &["vacuna", "vacunar", "inmunizacion"],
        replies: &["💉 INFORMACIÓN SOBRE VACUNAS\n\n\
            🐕 Perros: vacuna múltiple a las 6-8, 10-12 y 14-16 semanas, \
            rabia en la última dosis y refuerzo anual.\n\
            🐱 Gatos: triple felina a las 6-8, 10-12 y 14-16 semanas, \
            rabia en la última dosis y refuerzo anual.\n\n\
            💡 Mantén el calendario al día para proteger a tu mascota."],
        confidence: 0.95,
    },
    Intent {
        name: "feeding",
        keywords: &["alimentacion", "comida", "comer", "dieta", "alimento"],
        replies: &["🍽️ ALIMENTACIÓN PARA MASCOTAS\n\n\
            🐕 Cachorros: 3-4 comidas al día. Adultos: 2 comidas de alimento balanceado. \
            Mayores de 7 años: alimento senior.\n\
            🐱 Gatitos: 3-4 comidas pequeñas altas en proteína. Adultos: 2-3 comidas al día.\n\
            Agua fresca siempre disponible.\n\n\
            ❌ Nunca les des chocolate, cebolla, ajo, uvas, aguacate ni huesos cocidos."],
        confidence: 0.93,
    },
    Intent {
        name: "help",
        keywords: &["help", "que puedes", "comandos"],
        replies: &["🤖 COMANDOS DISPONIBLES\n\n\
            📊 \"estadísticas\", \"tipo más común\", \"citas hoy\"\n\
            💼 \"ventas\", \"alertas\", \"productos\"\n\
            🏥 \"vacunas\", \"alimentación\", \"emergencia\"\n\
            🔮 \"predicciones\", \"clustering\""],
        confidence: 0.90,
    },
];

const DEFAULT_REPLY: &str = "¡Hola! 👋 Soy tu asistente virtual con IA.\n\n\
    Puedo ayudarte con estadísticas del negocio, citas, ventas, \
    información veterinaria y predicciones.\n\n\
    Escribe \"ayuda\" para ver todos los comandos disponibles.";

fn message_noise_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-zñü0-9\s]").expect("static pattern is valid"))
}

/// 消息规范化：小写，去掉重音，只保留字母、数字和空白，合并连续空白
pub fn normalize_message(message: &str) -> String {
    let folded: String = message
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'á' => 'a',
            'é' => 'e',
            'í' => 'i',
            'ó' => 'o',
            'ú' => 'u',
            other => other,
        })
        .collect();
    let cleaned = message_noise_regex().replace_all(&folded, "");
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 关键词回复结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackReply {
    pub text: String,
    pub intent: String,
    pub confidence: f32,
}

/// 基于关键词的回复器
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordResponder;

impl KeywordResponder {
    pub fn new() -> Self {
        Self
    }

    /// 返回第一个命中的意图
    pub fn classify(&self, message: &str) -> Option<&'static Intent> {
        let normalized = normalize_message(message);
        INTENTS.iter().find(|intent| intent.matches(&normalized))
    }

    pub fn respond<R: Rng + ?Sized>(&self, message: &str, rng: &mut R) -> FallbackReply {
        match self.classify(message) {
            Some(intent) => {
                let text = intent.replies.choose(rng).copied().unwrap_or(DEFAULT_REPLY);
                FallbackReply {
                    text: text.to_string(),
                    intent: intent.name.to_string(),
                    confidence: intent.confidence,
                }
            }
            None => FallbackReply {
                text: DEFAULT_REPLY.to_string(),
                intent: DEFAULT_INTENT.to_string(),
                confidence: DEFAULT_CONFIDENCE,
            },
        }
    }
}
