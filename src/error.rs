use std::io;
use thiserror::Error;

/// 采集 worker 的终止原因，经由 error signal 交给 Supervisor
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("独占设备失败: {0}")]
    Grab(#[source] io::Error),

    #[error("读取输入事件失败: {0}")]
    Read(#[source] io::Error),

    #[error("报告队列已关闭")]
    QueueClosed,

    #[error("worker 未上报结果便退出")]
    Vanished,
}

/// 分发器写入 endpoint 失败，对整个进程是致命的
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("写入 {endpoint} 失败: {source}")]
    Write {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("写入 {endpoint} 不完整: {written}/{expected} 字节")]
    PartialWrite {
        endpoint: String,
        written: usize,
        expected: usize,
    },
}
