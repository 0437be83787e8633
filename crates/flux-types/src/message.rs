//! 线路协议：以 `"type"` 字段区分的 JSON 文本帧。
//!
//! 按方向拆成四个枚举，收到未知类型或缺少必填字段时反序列化直接失败。

use serde::{Deserialize, Deserializer, Serialize};

use crate::detection::{BoundingBox, FeatureMap, FrameId};

/// 节点 → Broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum NodeMessage {
    /// 连接后上报逻辑名称
    Identifier { id: String },
    BoundingBoxes {
        frame_id: FrameId,
        boxes: Vec<BoundingBox>,
    },
    FeatureMap {
        object_id: u64,
        feature_map: FeatureMap,
    },
    Test {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u32>,
    },
}

/// 客户端 → Broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Start {
        #[serde(deserialize_with = "string_or_number")]
        camera_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        frame_id: Option<FrameId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        box_id: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<String>,
    },
    Stop { object_id: u64 },
    Test {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u32>,
    },
}

/// Broker → 节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum NodeCommand {
    Start {
        object_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        frame_id: Option<FrameId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        box_id: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<String>,
    },
    Stop { object_id: u64 },
    FeatureMap {
        object_id: u64,
        feature_map: FeatureMap,
    },
    Test {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u32>,
    },
}

/// Broker → 客户端
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientUpdate {
    BoundingBoxes {
        camera_id: String,
        frame_id: FrameId,
        boxes: Vec<BoundingBox>,
    },
    Test {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u32>,
    },
}

/// `start` 指向的目标：历史帧中的某个框，或客户端直接上传的图片
#[derive(Debug, Clone, PartialEq)]
pub enum StartTarget {
    Box { frame_id: FrameId, box_id: u64 },
    /// base64 编码的图片
    Image(String),
}

impl StartTarget {
    /// 两者都有时优先使用框引用
    pub fn resolve(
        frame_id: Option<FrameId>,
        box_id: Option<u64>,
        image: Option<&str>,
    ) -> Option<Self> {
        match (frame_id, box_id, image) {
            (Some(frame_id), Some(box_id), _) => Some(StartTarget::Box { frame_id, box_id }),
            (_, _, Some(image)) => Some(StartTarget::Image(image.to_string())),
            _ => None,
        }
    }
}

impl ClientMessage {
    pub fn start_target(&self) -> Option<StartTarget> {
        match self {
            ClientMessage::Start {
                frame_id,
                box_id,
                image,
                ..
            } => StartTarget::resolve(*frame_id, *box_id, image.as_deref()),
            _ => None,
        }
    }
}

impl NodeCommand {
    /// 由新建的对象 ID 和目标构造下发给节点的 `start`
    pub fn start(object_id: u64, target: StartTarget) -> Self {
        match target {
            StartTarget::Box { frame_id, box_id } => NodeCommand::Start {
                object_id,
                frame_id: Some(frame_id),
                box_id: Some(box_id),
                image: None,
            },
            StartTarget::Image(image) => NodeCommand::Start {
                object_id,
                frame_id: None,
                box_id: None,
                image: Some(image),
            },
        }
    }

    pub fn start_target(&self) -> Option<StartTarget> {
        match self {
            NodeCommand::Start {
                frame_id,
                box_id,
                image,
                ..
            } => StartTarget::resolve(*frame_id, *box_id, image.as_deref()),
            _ => None,
        }
    }
}

/// 兼容客户端把回退分配的数字 ID 直接当数字发送
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(u64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Str(s) => s,
        Raw::Num(n) => n.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_client_start_by_box() {
        let raw = r#"{"type":"start","cameraId":"cam1","frameId":1,"boxId":5}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();

        assert_eq!(
            msg.start_target(),
            Some(StartTarget::Box {
                frame_id: FrameId(1.0),
                box_id: 5
            })
        );
        match msg {
            ClientMessage::Start { camera_id, .. } => assert_eq!(camera_id, "cam1"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_numeric_camera_id_accepted() {
        let raw = r#"{"type":"start","cameraId":2,"image":"aGVsbG8="}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match &msg {
            ClientMessage::Start { camera_id, .. } => assert_eq!(camera_id, "2"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            msg.start_target(),
            Some(StartTarget::Image("aGVsbG8=".to_string()))
        );
    }

    #[test]
    fn test_start_without_target() {
        let raw = r#"{"type":"start","cameraId":"cam1","frameId":1}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.start_target(), None);
    }

    #[test]
    fn test_unknown_type_and_missing_field_rejected() {
        assert!(serde_json::from_str::<NodeMessage>(r#"{"type":"dance"}"#).is_err());
        let missing_feature_map = r#"{"type":"featureMap","objectId":1}"#;
        assert!(serde_json::from_str::<NodeMessage>(missing_feature_map).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"stop"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
    }

    #[test]
    fn test_node_start_wire_shape() {
        let cmd = NodeCommand::start(
            1,
            StartTarget::Box {
                frame_id: FrameId(1.0),
                box_id: 5,
            },
        );
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            json!({"type": "start", "objectId": 1, "frameId": 1.0, "boxId": 5})
        );

        let cmd = NodeCommand::start(2, StartTarget::Image("abc".to_string()));
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            json!({"type": "start", "objectId": 2, "image": "abc"})
        );
    }

    #[test]
    fn test_bounding_boxes_to_client() {
        let update = ClientUpdate::BoundingBoxes {
            camera_id: "cam1".to_string(),
            frame_id: FrameId(12.5),
            boxes: vec![BoundingBox::new(1, [0.0, 0.0, 1.0, 1.0], "car", 0.5)],
        };
        let v = serde_json::to_value(&update).unwrap();
        assert_eq!(v["type"], "boundingBoxes");
        assert_eq!(v["cameraId"], "cam1");
        assert_eq!(v["frameId"], 12.5);
        assert_eq!(v["boxes"][0]["boxId"], 1);
    }

    #[test]
    fn test_feature_map_shared_shape() {
        // 节点上报与 Broker 转发使用同一形状
        let up = NodeMessage::FeatureMap {
            object_id: 7,
            feature_map: vec![0.25, 0.5],
        };
        let raw = serde_json::to_string(&up).unwrap();
        let down: NodeCommand = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            down,
            NodeCommand::FeatureMap {
                object_id: 7,
                feature_map: vec![0.25, 0.5]
            }
        );
    }
}
