/// 兼容旧式完成回调
///
/// 异步结果是唯一的数据来源，回调只是额外的观察者：
/// 以借用方式收到同一个结果，调用方仍然拿到原始结果。
use crate::error::{AnonymizerError, Result};

/// 用结果调用一次回调，然后原样返回结果
pub fn settle<T, F>(result: Result<T>, callback: F) -> Result<T>
where
    F: FnOnce(std::result::Result<&T, &AnonymizerError>),
{
    callback(result.as_ref());
    result
}
