use std::{
    ffi::{c_char, CStr, CString},
    ptr::null,
};

use crate::{
    egl_context::TEXTURE_EXTERNAL_OES,
    import::BoundTextures,
    types::error::{Nv12Error, Result},
};

const POSITION_ATTRIB: u32 = 0;
const TEXCOORD_ATTRIB: u32 = 1;

/// Full screen triangle strip, `x, y, u, v` per vertex. Texture row 0 is the
/// top of the image, so `v` runs opposite to clip space `y`.
const QUAD: [f32; 16] = [
    -1.0, -1.0, 0.0, 1.0, //
    1.0, -1.0, 1.0, 1.0, //
    -1.0, 1.0, 0.0, 0.0, //
    1.0, 1.0, 1.0, 0.0, //
];

const EXTERNAL_VERTEX_SHADER: &str = r#"#version 100
attribute vec2 a_position;
attribute vec2 a_texcoord;
varying vec2 v_texcoord;
void main() {
    gl_Position = vec4(a_position, 0.0, 1.0);
    v_texcoord = a_texcoord;
}
"#;

// The driver samples the whole NV12 image and hands back RGB.
const EXTERNAL_FRAGMENT_SHADER: &str = r#"#version 100
#extension GL_OES_EGL_image_external : require
precision mediump float;
uniform samplerExternalOES u_frame;
varying vec2 v_texcoord;
void main() {
    gl_FragColor = texture2D(u_frame, v_texcoord);
}
"#;

const PLANES_VERTEX_SHADER: &str = r#"#version 300 es
layout(location = 0) in vec2 a_position;
layout(location = 1) in vec2 a_texcoord;
out vec2 v_texcoord;
void main() {
    gl_Position = vec4(a_position, 0.0, 1.0);
    v_texcoord = a_texcoord;
}
"#;

const PLANES_FRAGMENT_SHADER: &str = r#"#version 300 es
precision mediump float;
uniform sampler2D u_luma;
uniform sampler2D u_chroma;
in vec2 v_texcoord;
out vec4 frag_color;
void main() {
    float y = texture(u_luma, v_texcoord).r;
    vec2 uv = texture(u_chroma, v_texcoord).rg - vec2(0.5);
    float r = y + 1.402 * uv.y;
    float g = y - 0.344136 * uv.x - 0.714136 * uv.y;
    float b = y + 1.772 * uv.x;
    frag_color = vec4(clamp(vec3(r, g, b), 0.0, 1.0), 1.0);
}
"#;

pub struct GlProgram {
    id: u32,
}

impl GlProgram {
    pub fn new(name: &str, vertex_shader: &str, fragment_shader: &str) -> Result<Self> {
        let vertex_id = compile_shader(gl::VERTEX_SHADER, vertex_shader, name)?;
        let fragment_id = match compile_shader(gl::FRAGMENT_SHADER, fragment_shader, name) {
            Ok(id) => id,
            Err(e) => {
                unsafe { gl::DeleteShader(vertex_id) };
                return Err(e);
            }
        };

        unsafe {
            let id = gl::CreateProgram();
            gl::AttachShader(id, vertex_id);
            gl::AttachShader(id, fragment_id);
            gl::BindAttribLocation(id, POSITION_ATTRIB, c"a_position".as_ptr());
            gl::BindAttribLocation(id, TEXCOORD_ATTRIB, c"a_texcoord".as_ptr());
            gl::LinkProgram(id);

            // The program keeps the compiled code alive.
            gl::DeleteShader(vertex_id);
            gl::DeleteShader(fragment_id);

            let mut linked = 0;
            gl::GetProgramiv(id, gl::LINK_STATUS, &mut linked);
            if linked == 0 {
                let mut len = 0;
                gl::GetProgramiv(id, gl::INFO_LOG_LENGTH, &mut len);
                let mut info_log = vec![0u8; len.max(1) as usize];
                gl::GetProgramInfoLog(id, len, &mut len, info_log.as_mut_ptr() as *mut c_char);
                gl::DeleteProgram(id);
                return Err(Nv12Error::Gl(format!(
                    "Program '{name}' failed to link: {}",
                    info_log_to_string(&info_log)
                )));
            }

            log::trace!("Linked program '{name}' ({id})");
            Ok(Self { id })
        }
    }

    fn use_program(&self) {
        unsafe { gl::UseProgram(self.id) };
    }

    fn set_sampler(&self, name: &CStr, unit: i32) {
        unsafe {
            let location = gl::GetUniformLocation(self.id, name.as_ptr());
            gl::Uniform1i(location, unit);
        }
    }
}

impl Drop for GlProgram {
    fn drop(&mut self) {
        unsafe {
            gl::DeleteProgram(self.id);
        }
    }
}

fn compile_shader(kind: gl::types::GLenum, source: &str, name: &str) -> Result<u32> {
    let src = CString::new(source)
        .map_err(|_| Nv12Error::Gl(format!("Shader '{name}' contains a NUL byte")))?;
    let src_ptr = src.as_ptr();

    unsafe {
        let shader = gl::CreateShader(kind);
        gl::ShaderSource(shader, 1, &src_ptr, null());
        gl::CompileShader(shader);

        let mut compiled = 0;
        gl::GetShaderiv(shader, gl::COMPILE_STATUS, &mut compiled);
        if compiled == 0 {
            let mut len = 0;
            gl::GetShaderiv(shader, gl::INFO_LOG_LENGTH, &mut len);
            let mut info_log = vec![0u8; len.max(1) as usize];
            gl::GetShaderInfoLog(shader, len, &mut len, info_log.as_mut_ptr() as *mut c_char);
            gl::DeleteShader(shader);

            let stage = if kind == gl::VERTEX_SHADER {
                "vertex"
            } else {
                "fragment"
            };
            return Err(Nv12Error::Gl(format!(
                "Shader '{name}' ({stage}) failed to compile: {}",
                info_log_to_string(&info_log)
            )));
        }
        Ok(shader)
    }
}

fn info_log_to_string(info_log: &[u8]) -> String {
    let end = info_log
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(info_log.len());
    String::from_utf8_lossy(&info_log[..end]).trim_end().to_string()
}

fn check_gl_error(what: &str) -> Result<()> {
    let err = unsafe { gl::GetError() };
    if err != gl::NO_ERROR {
        log::error!("GL error after {what}: {err:#X}");
        return Err(Nv12Error::Gl(format!("{what}: {err:#X}")));
    }
    Ok(())
}

/// Creates a 2D texture holding `data`, tightly packed rows of `width` texels.
pub fn upload_texture(
    internal_format: gl::types::GLenum,
    format: gl::types::GLenum,
    width: i32,
    height: i32,
    data: &[u8],
) -> Result<u32> {
    let mut texture = 0;
    unsafe {
        gl::GenTextures(1, &mut texture);
        gl::BindTexture(gl::TEXTURE_2D, texture);
        gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MIN_FILTER, gl::LINEAR as i32);
        gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MAG_FILTER, gl::LINEAR as i32);
        gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_S, gl::CLAMP_TO_EDGE as i32);
        gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_T, gl::CLAMP_TO_EDGE as i32);
        gl::PixelStorei(gl::UNPACK_ALIGNMENT, 1);
        gl::TexImage2D(
            gl::TEXTURE_2D,
            0,
            internal_format as i32,
            width,
            height,
            0,
            format,
            gl::UNSIGNED_BYTE,
            data.as_ptr() as *const _,
        );
        gl::BindTexture(gl::TEXTURE_2D, 0);
    }

    if let Err(e) = check_gl_error("glTexImage2D") {
        unsafe { gl::DeleteTextures(1, &texture) };
        return Err(e);
    }
    log::trace!("Uploaded {width}x{height} texture {texture} (format {internal_format:#X})");
    Ok(texture)
}

/// Draws NV12 textures as RGB onto the current surface.
pub struct Renderer {
    external: GlProgram,
    planes: GlProgram,
    vbo: u32,
}

impl Renderer {
    /// Needs a current GLES 3 context.
    pub fn new() -> Result<Self> {
        let external = GlProgram::new("external", EXTERNAL_VERTEX_SHADER, EXTERNAL_FRAGMENT_SHADER)?;
        let planes = GlProgram::new("nv12_planes", PLANES_VERTEX_SHADER, PLANES_FRAGMENT_SHADER)?;

        let mut vbo = 0;
        unsafe {
            gl::GenBuffers(1, &mut vbo);
            gl::BindBuffer(gl::ARRAY_BUFFER, vbo);
            let bytes: &[u8] = bytemuck::cast_slice(&QUAD);
            gl::BufferData(
                gl::ARRAY_BUFFER,
                bytes.len() as isize,
                bytes.as_ptr() as *const _,
                gl::STATIC_DRAW,
            );
            gl::BindBuffer(gl::ARRAY_BUFFER, 0);
        }
        check_gl_error("quad upload")?;

        Ok(Self {
            external,
            planes,
            vbo,
        })
    }

    pub fn draw(&self, textures: &BoundTextures, width: i32, height: i32) -> Result<()> {
        unsafe {
            gl::Viewport(0, 0, width, height);
            gl::ClearColor(0.0, 0.0, 0.0, 1.0);
            gl::Clear(gl::COLOR_BUFFER_BIT);

            match textures {
                BoundTextures::External { texture } => {
                    self.external.use_program();
                    self.external.set_sampler(c"u_frame", 0);
                    gl::ActiveTexture(gl::TEXTURE0);
                    gl::BindTexture(TEXTURE_EXTERNAL_OES, *texture);
                }
                BoundTextures::Planes { luma, chroma, .. } => {
                    self.planes.use_program();
                    self.planes.set_sampler(c"u_luma", 0);
                    self.planes.set_sampler(c"u_chroma", 1);
                    gl::ActiveTexture(gl::TEXTURE0);
                    gl::BindTexture(gl::TEXTURE_2D, *luma);
                    gl::ActiveTexture(gl::TEXTURE1);
                    gl::BindTexture(gl::TEXTURE_2D, *chroma);
                }
            }

            let stride = (4 * std::mem::size_of::<f32>()) as i32;
            gl::BindBuffer(gl::ARRAY_BUFFER, self.vbo);
            gl::EnableVertexAttribArray(POSITION_ATTRIB);
            gl::VertexAttribPointer(POSITION_ATTRIB, 2, gl::FLOAT, gl::FALSE, stride, null());
            gl::EnableVertexAttribArray(TEXCOORD_ATTRIB);
            gl::VertexAttribPointer(
                TEXCOORD_ATTRIB,
                2,
                gl::FLOAT,
                gl::FALSE,
                stride,
                (2 * std::mem::size_of::<f32>()) as *const _,
            );

            gl::DrawArrays(gl::TRIANGLE_STRIP, 0, 4);

            gl::DisableVertexAttribArray(POSITION_ATTRIB);
            gl::DisableVertexAttribArray(TEXCOORD_ATTRIB);
            gl::BindBuffer(gl::ARRAY_BUFFER, 0);
            gl::ActiveTexture(gl::TEXTURE0);
        }
        check_gl_error("draw")
    }

    /// Reads the framebuffer back as RGB24, top row first.
    pub fn read_rgb(&self, width: i32, height: i32) -> Result<Vec<u8>> {
        let mut rgba = vec![0u8; width as usize * height as usize * 4];
        unsafe {
            gl::Finish();
            gl::PixelStorei(gl::PACK_ALIGNMENT, 1);
            gl::ReadPixels(
                0,
                0,
                width,
                height,
                gl::RGBA,
                gl::UNSIGNED_BYTE,
                rgba.as_mut_ptr() as *mut _,
            );
        }
        check_gl_error("glReadPixels")?;
        Ok(rgba_to_rgb_flipped(&rgba, width as usize, height as usize))
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        unsafe {
            gl::DeleteBuffers(1, &self.vbo);
        }
    }
}

/// Drops alpha and reverses row order: GL reads bottom-up.
fn rgba_to_rgb_flipped(rgba: &[u8], width: usize, height: usize) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(width * height * 3);
    for row in rgba.chunks_exact(width * 4).take(height).rev() {
        for px in row.chunks_exact(4) {
            rgb.extend_from_slice(&px[..3]);
        }
    }
    rgb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readback_drops_alpha_and_flips_rows() {
        #[rustfmt::skip]
        let rgba = [
            1, 2, 3, 255,   4, 5, 6, 255, // bottom row
            7, 8, 9, 255,  10, 11, 12, 255, // top row
        ];
        assert_eq!(
            rgba_to_rgb_flipped(&rgba, 2, 2),
            vec![7, 8, 9, 10, 11, 12, 1, 2, 3, 4, 5, 6]
        );
    }

    #[test]
    fn quad_maps_the_top_of_the_image_to_the_top_of_the_screen() {
        for vertex in QUAD.chunks_exact(4) {
            let (y, v) = (vertex[1], vertex[3]);
            assert_eq!(v, (1.0 - y) / 2.0);
        }
    }

    #[test]
    fn info_logs_stop_at_the_terminator() {
        assert_eq!(info_log_to_string(b"0:1: error\n\0\0"), "0:1: error");
        assert_eq!(info_log_to_string(b""), "");
    }
}
