use serde::{Deserialize, Serialize};

use crate::protocol::action::Action;
use crate::protocol::common::{Header, NodePosition, Trajectory};

/// An order to be communicated from master control to the AGV.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    #[serde(flatten)]
    pub header: Header,
    /// Unique order identification.
    pub order_id: String,
    /// orderUpdate identification. Is unique per order_id. If an order update is rejected, this field is to be passed in the rejection message.
    pub order_update_id: u32,
    /// Unique identifier of the zone set that the AGV has to use for navigation or that was used by MC for planning. Do not add to message if no zones are used.
    pub zone_set_id: Option<String>,
    /// This list holds the base and the horizon nodes of the order graph.
    pub nodes: Vec<Node>,
    /// Base and Horizon Edges of the Order Graph.
    pub edges: Vec<Edge>,
}

impl Order {
    /// Last node of the base, i.e. the last released node. None when the order
    /// carries no base.
    pub fn base_end(&self) -> Option<&Node> {
        self.nodes.iter().rev().find(|n| n.released)
    }

    /// Iterates all actions attached to released nodes and edges.
    pub fn released_actions(&self) -> impl Iterator<Item = &Action> {
        let node_actions = self
            .nodes
            .iter()
            .filter(|n| n.released)
            .flat_map(|n| n.actions.iter());
        let edge_actions = self
            .edges
            .iter()
            .filter(|e| e.released)
            .flat_map(|e| e.actions.iter());
        node_actions.chain(edge_actions)
    }
}

#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique node identification. For example: pumpenhaus_1, MONTAGE
    pub node_id: String,
    /// Id to track the sequence of nodes and edges in an order and to simplify order updates. The main purpose is to distinguish between a node which is passed more than once within one order_id. The variable sequence_id runs across all nodes and edges of the same order and is reset when a new order_id is issued.
    pub sequence_id: u32,
    /// Verbose Node Description.
    pub node_description: Option<String>,
    /// If true, the node is part of the base plan. If false, the node is part of the horizon plan.
    pub released: bool,
    /// Defines the position on a map in world coordinates. Each floor has its own map.
    pub node_position: Option<NodePosition>,
    /// Array of actions that are to be executed on the node. Their sequence in the list governs their sequence of execution.
    pub actions: Vec<Action>,
}

#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    /// Unique edge identification
    pub edge_id: String,
    /// Id to track the sequence of nodes and edges in an order and to simplify order updates.
    pub sequence_id: u32,
    /// Verbose description of the edge.
    pub edge_description: Option<String>,
    /// If true, the edge is part of the base plan. If false, the edge is part of the horizon plan.
    pub released: bool,
    /// The node_id of the start node.
    pub start_node_id: String,
    /// The node_id of the end node.
    pub end_node_id: String,
    /// Permitted maximum speed of the AGV on the edge in m/s.
    pub max_speed: Option<f32>,
    /// Permitted maximum height of the vehicle, including the load, on edge. In meters.
    pub max_height: Option<f32>,
    /// Permitted minimal height of the edge measured at the bottom of the load. In meters.
    pub min_height: Option<f32>,
    /// Orientation of the AGV on the edge relative to the map coordinate origin (for holonomic vehicles with more than one driving direction).
    pub orientation: Option<f32>,
    /// Sets direction at junctions for line-guided vehicles. Can be descriptive (left, right, middle, straight) or a frequency ("433MHz").
    pub direction: Option<String>,
    /// If true, rotation is allowed on the edge.
    pub rotation_allowed: Option<bool>,
    /// Maximum rotation speed in rad/s.
    pub max_rotation_speed: Option<f32>,
    /// Distance of the path from startNode to endNode in meters. This value is used by line-guided AGVs to decrease their speed before reaching a stop position.
    pub length: Option<f32>,
    /// Trajectory object for this edge as a NURBS. Defines the curve on which the AGV should move between startNode and endNode. Can be omitted if the AGV plans its own trajectory.
    pub trajectory: Option<Trajectory>,
    /// Array of action objects with detailed information.
    pub actions: Vec<Action>,
}
