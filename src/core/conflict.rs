use crate::core::entry::EntryPair;
use crate::core::resolver::Operation;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// 冲突解决策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// 报告冲突，两侧都不动
    #[default]
    Skip,
    LocalWins,
    RemoteWins,
    /// 逐个询问交互回调
    Prompt,
}

impl std::fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictPolicy::Skip => write!(f, "skip"),
            ConflictPolicy::LocalWins => write!(f, "local_wins"),
            ConflictPolicy::RemoteWins => write!(f, "remote_wins"),
            ConflictPolicy::Prompt => write!(f, "prompt"),
        }
    }
}

impl From<&str> for ConflictPolicy {
    fn from(s: &str) -> Self {
        match s {
            "local_wins" | "local" => ConflictPolicy::LocalWins,
            "remote_wins" | "remote" => ConflictPolicy::RemoteWins,
            "prompt" => ConflictPolicy::Prompt,
            _ => ConflictPolicy::Skip,
        }
    }
}

/// 单个冲突的选择结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictChoice {
    Local,
    Remote,
    Skip,
}

/// `prompt` 策略的交互回调
pub trait ConflictPrompt: Send + Sync {
    fn choose(&self, pair: &EntryPair) -> ConflictChoice;
}

/// 冲突解决器
///
/// 把 `conflict` 按策略改写成具体操作；保持 `Conflict` 表示未解决。
#[derive(Clone, Default)]
pub struct ConflictResolver {
    policy: ConflictPolicy,
    prompt: Option<Arc<dyn ConflictPrompt>>,
}

impl ConflictResolver {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self {
            policy,
            prompt: None,
        }
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn ConflictPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    pub fn resolve(&self, pair: &EntryPair) -> Operation {
        let choice = match self.policy {
            ConflictPolicy::Skip => ConflictChoice::Skip,
            ConflictPolicy::LocalWins => ConflictChoice::Local,
            ConflictPolicy::RemoteWins => ConflictChoice::Remote,
            ConflictPolicy::Prompt => match &self.prompt {
                Some(prompt) => prompt.choose(pair),
                None => {
                    warn!("冲突策略为 prompt 但没有交互回调，跳过: {}", pair.rel_path);
                    ConflictChoice::Skip
                }
            },
        };

        let op = Self::apply(choice, pair);
        debug!("冲突 {} -> {}", pair, op);
        op
    }

    /// 胜出一侧存在则复制过去，不存在则删除另一侧
    fn apply(choice: ConflictChoice, pair: &EntryPair) -> Operation {
        match choice {
            ConflictChoice::Local if pair.local.is_some() => Operation::CopyLocal,
            ConflictChoice::Local => Operation::DeleteRemote,
            ConflictChoice::Remote if pair.remote.is_some() => Operation::CopyRemote,
            ConflictChoice::Remote => Operation::DeleteLocal,
            ConflictChoice::Skip => Operation::Conflict,
        }
    }
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("policy", &self.policy)
            .field("prompt", &self.prompt.is_some())
            .finish()
    }
}
