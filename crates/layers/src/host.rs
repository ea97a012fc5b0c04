use streaming::CameraPose;

/// The rendering host a volume layer is attached to.
///
/// The host owns the scene and the render loop; the layer only asks it to
/// redraw and reads the current camera.
pub trait RenderHost: Send + Sync {
    fn request_redraw(&self);

    fn camera_pose(&self) -> CameraPose;
}
