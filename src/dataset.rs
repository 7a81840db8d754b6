//! 训练数据
//!
//! 对话数据以 JSON 数组保存：`[["pregunta", "respuesta"], ...]`。
//! 文件不存在时写入内置的宠物店对话样本。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::Result;
use crate::tokenizer::Tokenizer;
use crate::trainer::TrainingPair;

/// (问题, 回答) 对话数据集
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrainingData {
    pub pairs: Vec<(String, String)>,
}

impl TrainingData {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self { pairs }
    }

    /// 内置的默认对话
    pub fn builtin() -> Self {
        Self::new(
            DEFAULT_PAIRS
                .iter()
                .map(|&(q, a)| (q.to_string(), a.to_string()))
                .collect(),
        )
    }

    /// 从 JSON 文件加载
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// 保存为 JSON 文件（自动创建父目录）
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// 加载数据；文件不存在时写入默认数据并返回
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = if path.exists() {
            Self::load(path)?
        } else {
            log::warn!("训练数据 {} 不存在，写入默认数据", path.display());
            let data = Self::builtin();
            data.save(path)?;
            data
        };
        log::info!("训练数据已加载: {} 个样本", data.len());
        Ok(data)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// 构建词表用的语料：所有问题和回答
    pub fn corpus(&self) -> Vec<&str> {
        self.pairs
            .iter()
            .flat_map(|(q, a)| [q.as_str(), a.as_str()])
            .collect()
    }

    /// 编码为训练样本，输入和目标长度都是 `max_len`
    pub fn encode_pairs(&self, tokenizer: &Tokenizer, max_len: usize) -> Result<Vec<TrainingPair>> {
        self.pairs
            .iter()
            .map(|(q, a)| Ok((tokenizer.encode(q, max_len)?, tokenizer.encode(a, max_len)?)))
            .collect()
    }
}

const DEFAULT_PAIRS: &[(&str, &str)] = &[
    // 问候
    ("hola", "¡Hola! Soy tu asistente virtual del Pet Store. ¿En qué puedo ayudarte?"),
    ("buenos dias", "¡Buenos días! Estoy aquí para ayudarte con información sobre mascotas y servicios."),
    ("como estas", "¡Muy bien! Listo para ayudarte. ¿Qué necesitas saber?"),
    ("adios", "¡Hasta pronto! Cuida bien a tus mascotas."),
    ("gracias", "¡De nada! Estoy aquí para ayudarte."),
    // 统计
    ("muestrame las estadisticas", "Te muestro las estadísticas generales del sistema con información actualizada."),
    ("cuantas mascotas hay", "Déjame consultar el número total de mascotas registradas en el sistema."),
    ("cuantos clientes tenemos", "Voy a revisar el total de clientes registrados en la base de datos."),
    ("dame un reporte", "Por supuesto, preparo un reporte completo con las métricas principales."),
    ("metricas del negocio", "Aquí están las métricas clave del negocio con datos en tiempo real."),
    // 预约
    ("cuantas citas hay hoy", "Déjame consultar las citas programadas para el día de hoy."),
    ("hay citas programadas", "Voy a revisar la agenda de citas para informarte."),
    ("proximas citas", "Te muestro las próximas citas programadas en el sistema."),
    ("agenda del dia", "Aquí está la agenda completa del día con todas las citas."),
    // 销售
    ("cuanto vendimos hoy", "Voy a consultar el total de ventas realizadas hoy."),
    ("ventas del mes", "Te muestro el reporte de ventas del mes actual con detalles."),
    ("cuales son los ingresos", "Aquí está el análisis de ingresos con información detallada."),
    ("transacciones del dia", "Déjame revisar las transacciones realizadas el día de hoy."),
    // 宠物
    ("tipo de mascota mas comun", "Voy a analizar qué tipo de mascota es el más común en nuestro sistema."),
    ("que mascotas tenemos", "Te muestro la distribución de tipos de mascotas registradas."),
    ("razas mas frecuentes", "Aquí está el análisis de las razas más frecuentes."),
    // 库存
    ("cuantos productos tenemos", "Déjame consultar la cantidad total de productos en inventario."),
    ("productos proximos a vencer", "Voy a revisar los productos que están próximos a su fecha de vencimiento."),
    ("alertas de inventario", "Te muestro las alertas de productos con bajo stock."),
    ("stock bajo", "Aquí están los productos que necesitan reposición urgente."),
    // 预测
    ("predice tipo de mascota", "Voy a usar el modelo de machine learning para hacer una predicción."),
    ("que predicciones tienes", "Puedo hacer predicciones sobre tipos de mascotas y asistencia a citas."),
    // 聚类
    ("analisis de clustering", "Voy a ejecutar el análisis de clustering jerárquico sobre los datos."),
    ("segmenta clientes", "Te muestro la segmentación de clientes usando machine learning."),
    ("agrupa mascotas", "Aquí está el agrupamiento de mascotas por características similares."),
    // 帮助
    ("que puedes hacer", "Puedo ayudarte con estadísticas, citas, ventas, inventario y predicciones con IA."),
    ("ayuda", "Estoy aquí para ayudarte con información del negocio y análisis inteligentes."),
    ("comandos disponibles", "Puedo procesar consultas sobre métricas, citas, ventas, productos y más."),
    // 服务
    ("servicios disponibles", "Te muestro la lista completa de servicios veterinarios disponibles."),
    ("horario de atencion", "Déjame consultar los horarios y disponibilidad de atención."),
    ("veterinarios", "Aquí está la información sobre los veterinarios del equipo."),
    // 综合
    ("dame un resumen completo", "Te preparo un resumen ejecutivo con todas las métricas principales."),
    ("como va el negocio", "Te muestro un análisis completo del estado actual del negocio."),
    ("que necesita atencion", "Aquí están los puntos que requieren atención inmediata."),
    ("cual es la tendencia", "Voy a analizar las tendencias en ventas y atención a clientes."),
    ("comparativa con mes anterior", "Te muestro la comparativa de ventas con el mes anterior."),
    ("estamos creciendo", "Aquí está el análisis de crecimiento del negocio."),
];
